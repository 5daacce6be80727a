use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::download::filename_from_uri;
use crate::core::paths::ENGINE_BINARY;

pub const KEY_DIFFUSION: &str = "diffusion";
pub const KEY_VAE: &str = "vae";
pub const KEY_TEXT_ENCODER: &str = "text-encoder";
pub const KEY_ENGINE: &str = "engine";

/// Weights that are several gigabytes must clear this before they count.
pub const LARGE_ASSET_MIN_BYTES: u64 = 1_000_000_000;
/// Anything smaller is almost certainly an HTML error page.
pub const SMALL_ASSET_MIN_BYTES: u64 = 1_000_000;

const HF_ZIMAGE: &str = "https://huggingface.co/leejet/Z-Image-Turbo-GGUF/resolve/main";
const VAE_URL: &str =
    "https://huggingface.co/black-forest-labs/FLUX.1-schnell/resolve/main/ae.safetensors";
const TEXT_ENCODER_FILE: &str = "Qwen3-4B-Instruct-2507-Q4_K_M.gguf";
const HF_QWEN: &str = "https://huggingface.co/unsloth/Qwen3-4B-Instruct-2507-GGUF/resolve/main";
const ENGINE_RELEASE_BASE: &str =
    "https://github.com/leejet/stable-diffusion.cpp/releases/download/master-385-34a6fd4";
const ENGINE_RELEASE_PREFIX: &str = "sd-master-34a6fd4-bin";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown asset `{0}`")]
    NotFound(String),
    #[error("duplicate asset key `{0}`")]
    DuplicateKey(String),
    #[error("assets `{first}` and `{second}` both install to {path:?}")]
    DuplicatePath {
        first: String,
        second: String,
        path: PathBuf,
    },
    #[error("unknown model variant `{0}` (expected q4_0, q5_0 or q8_0)")]
    UnknownVariant(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ModelVariant {
    #[default]
    #[serde(rename = "q4_0")]
    Q4_0,
    #[serde(rename = "q5_0")]
    Q5_0,
    #[serde(rename = "q8_0")]
    Q8_0,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 3] = [ModelVariant::Q4_0, ModelVariant::Q5_0, ModelVariant::Q8_0];

    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            ModelVariant::Q4_0 => "q4_0",
            ModelVariant::Q5_0 => "q5_0",
            ModelVariant::Q8_0 => "q8_0",
        }
    }

    #[must_use]
    pub fn filename(&self) -> String {
        format!("z_image_turbo-{}.gguf", self.key().to_uppercase())
    }

    #[must_use]
    pub fn approx_bytes(&self) -> u64 {
        match self {
            ModelVariant::Q4_0 => 3_950_000_000,
            ModelVariant::Q5_0 => 4_870_000_000,
            ModelVariant::Q8_0 => 7_060_000_000,
        }
    }

    #[must_use]
    pub fn recommended_vram(&self) -> &'static str {
        match self {
            ModelVariant::Q4_0 => "4GB",
            ModelVariant::Q5_0 => "6GB",
            ModelVariant::Q8_0 => "8GB+",
        }
    }

    pub fn descriptor(&self) -> AssetDescriptor {
        let filename = self.filename();
        AssetDescriptor {
            key: KEY_DIFFUSION.into(),
            name: format!("Z-Image-Turbo {}", self.key().to_uppercase()),
            url: format!("{HF_ZIMAGE}/{filename}"),
            relative_path: Path::new("models").join(filename),
            approx_bytes: self.approx_bytes(),
            checksum: None,
            archive: None,
            min_valid_bytes: LARGE_ASSET_MIN_BYTES,
            recommended_tier: Some(format!("{} VRAM", self.recommended_vram())),
        }
    }

    /// One row per quantization, for listing.
    pub fn summaries() -> Vec<AssetSummary> {
        Self::ALL
            .iter()
            .map(|variant| AssetSummary {
                key: variant.key().into(),
                ..AssetSummary::from(&variant.descriptor())
            })
            .collect()
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ModelVariant {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|variant| variant.key() == normalized)
            .ok_or_else(|| CatalogError::UnknownVariant(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSpec {
    pub format: ArchiveFormat,
    /// Relative to the cache root.
    pub extract_dir: PathBuf,
    #[serde(default)]
    pub strip_prefix_components: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetDescriptor {
    pub key: String,
    pub name: String,
    pub url: String,
    /// The file verification checks, relative to the cache root. For
    /// archives this is one of the extracted files.
    pub relative_path: PathBuf,
    /// Display only.
    #[serde(default)]
    pub approx_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveSpec>,
    pub min_valid_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_tier: Option<String>,
}

impl AssetDescriptor {
    #[must_use]
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }

    /// Where the fetched bytes land: the final file for plain assets, the
    /// archive inside its extraction directory otherwise.
    #[must_use]
    pub fn download_path(&self, root: &Path) -> PathBuf {
        match &self.archive {
            Some(archive) => root
                .join(&archive.extract_dir)
                .join(self.archive_file_name(archive.format)),
            None => self.path(root),
        }
    }

    fn archive_file_name(&self, format: ArchiveFormat) -> String {
        filename_from_uri(&self.url)
            .unwrap_or_else(|| format!("{}.{}", self.key, format.extension()))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetSummary {
    pub key: String,
    pub name: String,
    pub approx_bytes: u64,
    pub recommended_tier: Option<String>,
}

impl From<&AssetDescriptor> for AssetSummary {
    fn from(asset: &AssetDescriptor) -> Self {
        Self {
            key: asset.key.clone(),
            name: asset.name.clone(),
            approx_bytes: asset.approx_bytes,
            recommended_tier: asset.recommended_tier.clone(),
        }
    }
}

/// Read-only registry of the assets needed before generation can run.
#[derive(Debug, Clone)]
pub struct AssetCatalog {
    assets: Vec<AssetDescriptor>,
}

impl AssetCatalog {
    pub fn new(assets: Vec<AssetDescriptor>) -> Result<Self, CatalogError> {
        let mut keys = HashSet::new();
        for asset in &assets {
            if !keys.insert(asset.key.as_str()) {
                return Err(CatalogError::DuplicateKey(asset.key.clone()));
            }
        }
        for (index, asset) in assets.iter().enumerate() {
            if let Some(other) = assets[..index]
                .iter()
                .find(|other| other.relative_path == asset.relative_path)
            {
                return Err(CatalogError::DuplicatePath {
                    first: other.key.clone(),
                    second: asset.key.clone(),
                    path: asset.relative_path.clone(),
                });
            }
        }
        Ok(Self { assets })
    }

    /// Diffusion weights, VAE, text encoder, then the engine archive.
    pub fn for_variant(variant: ModelVariant, engine_url: &str) -> Self {
        Self {
            assets: vec![
                variant.descriptor(),
                vae_descriptor(),
                text_encoder_descriptor(),
                engine_descriptor(engine_url),
            ],
        }
    }

    pub fn get(&self, key: &str) -> Result<&AssetDescriptor, CatalogError> {
        self.assets
            .iter()
            .find(|asset| asset.key == key)
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssetDescriptor> {
        self.assets.iter()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn summary(&self) -> Vec<AssetSummary> {
        self.assets.iter().map(AssetSummary::from).collect()
    }
}

/// Release archive matching the running platform.
pub fn default_engine_url(use_cuda: bool) -> String {
    let flavor = if cfg!(target_os = "windows") {
        if use_cuda {
            "win-cuda12-x64"
        } else {
            "win-avx2-x64"
        }
    } else if cfg!(target_os = "macos") {
        "Darwin-macOS-15.5-arm64"
    } else {
        "Linux-Ubuntu-24.04-x86_64"
    };
    format!("{ENGINE_RELEASE_BASE}/{ENGINE_RELEASE_PREFIX}-{flavor}.zip")
}

fn vae_descriptor() -> AssetDescriptor {
    AssetDescriptor {
        key: KEY_VAE.into(),
        name: "FLUX autoencoder".into(),
        url: VAE_URL.into(),
        relative_path: PathBuf::from("models/ae.safetensors"),
        approx_bytes: 335_304_388,
        checksum: None,
        archive: None,
        min_valid_bytes: SMALL_ASSET_MIN_BYTES,
        recommended_tier: None,
    }
}

fn text_encoder_descriptor() -> AssetDescriptor {
    AssetDescriptor {
        key: KEY_TEXT_ENCODER.into(),
        name: "Qwen3 4B text encoder Q4_K_M".into(),
        url: format!("{HF_QWEN}/{TEXT_ENCODER_FILE}"),
        relative_path: Path::new("models").join(TEXT_ENCODER_FILE),
        approx_bytes: 2_497_280_256,
        checksum: None,
        archive: None,
        min_valid_bytes: LARGE_ASSET_MIN_BYTES,
        recommended_tier: None,
    }
}

fn engine_descriptor(url: &str) -> AssetDescriptor {
    let format = if url.ends_with(".tar.gz") || url.ends_with(".tgz") {
        ArchiveFormat::TarGz
    } else if url.ends_with(".tar.bz2") {
        ArchiveFormat::TarBz2
    } else {
        ArchiveFormat::Zip
    };
    AssetDescriptor {
        key: KEY_ENGINE.into(),
        name: "stable-diffusion.cpp engine".into(),
        url: url.into(),
        relative_path: Path::new("bin").join(ENGINE_BINARY),
        approx_bytes: 40_000_000,
        checksum: None,
        archive: Some(ArchiveSpec {
            format,
            extract_dir: PathBuf::from("bin"),
            strip_prefix_components: 0,
        }),
        min_valid_bytes: SMALL_ASSET_MIN_BYTES,
        recommended_tier: None,
    }
}
