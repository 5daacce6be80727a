mod catalog;
mod download;
mod install;
mod metadata;
mod uninstall;
mod verify;

pub use catalog::{
    default_engine_url, ArchiveFormat, ArchiveSpec, AssetCatalog, AssetDescriptor, AssetSummary,
    CatalogError, ModelVariant, KEY_DIFFUSION, KEY_ENGINE, KEY_TEXT_ENCODER, KEY_VAE,
    LARGE_ASSET_MIN_BYTES, SMALL_ASSET_MIN_BYTES,
};
pub use download::{
    extract_archive, partial_path, DownloadError, ExtractionError, Fetcher, HttpDownloader,
};
pub use install::{install, FailureKind, InstallFailure, InstallOutcome};
pub use metadata::{checksum_matches, compute_sha256};
pub use uninstall::{uninstall, UninstallError};
pub use verify::{AssetCheck, AssetStatus, InstallationReport, InstallationVerifier};
