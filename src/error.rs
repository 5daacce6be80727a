use thiserror::Error;

use crate::{
    engine::GenerationError,
    models::{
        CatalogError, DownloadError, ExtractionError, FailureKind, InstallOutcome, UninstallError,
    },
};

pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_UNKNOWN_ASSET: u8 = 3;
pub const EXIT_TRANSFER: u8 = 4;
pub const EXIT_EXTRACTION: u8 = 5;
pub const EXIT_GENERATION: u8 = 6;
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Uninstall(#[from] UninstallError),
    #[error("model installation incomplete: {}", .missing.join(", "))]
    IncompleteInstall {
        missing: Vec<String>,
        kind: Option<FailureKind>,
    },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// `None` when the install fully succeeded.
    pub fn from_install(outcome: &InstallOutcome) -> Option<Self> {
        if outcome.success {
            return None;
        }
        if outcome.cancelled {
            return Some(Error::Cancelled);
        }
        let missing = outcome
            .report
            .missing()
            .map(|check| check.key.clone())
            .collect();
        // An extraction failure outranks a transfer failure in the exit code.
        let kind = outcome
            .failures
            .iter()
            .map(|failure| failure.kind)
            .max_by_key(|kind| match kind {
                FailureKind::Extraction => 2,
                FailureKind::Transfer => 1,
                FailureKind::Verification => 0,
            });
        Some(Error::IncompleteInstall { missing, kind })
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Catalog(CatalogError::NotFound(_) | CatalogError::UnknownVariant(_))
            | Error::Uninstall(UninstallError::Catalog(CatalogError::NotFound(_))) => {
                EXIT_UNKNOWN_ASSET
            }
            Error::Catalog(_) | Error::Uninstall(_) => EXIT_FAILURE,
            Error::Download(DownloadError::Cancelled { .. }) | Error::Cancelled => EXIT_CANCELLED,
            Error::Download(_) => EXIT_TRANSFER,
            Error::Extraction(_) => EXIT_EXTRACTION,
            Error::Generation(_) => EXIT_GENERATION,
            Error::IncompleteInstall { kind, .. } => match kind {
                Some(FailureKind::Transfer) => EXIT_TRANSFER,
                Some(FailureKind::Extraction) => EXIT_EXTRACTION,
                _ => EXIT_FAILURE,
            },
            Error::Other(_) => EXIT_FAILURE,
        }
    }
}
