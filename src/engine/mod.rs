mod command;
mod request;

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

use crate::models::{AssetCatalog, CatalogError, KEY_DIFFUSION, KEY_TEXT_ENCODER, KEY_VAE};

pub use command::{CommandInvoker, EngineOptions, ARG_CONTRACT_VERSION};
pub use request::{fit_to_pixel_budget, GenerationRequest, Seed};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("image engine not found (searched {} locations)", .searched.len())]
    EngineNotFound { searched: Vec<PathBuf> },
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),
    #[error("failed to spawn engine {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("engine exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("engine finished but {} was not written", .0.display())]
    NoOutput(PathBuf),
    #[error("engine exceeded {0:?} timeout")]
    Timeout(Duration),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Turns a prompt into an image file. `CommandInvoker` is the production
/// implementation; tests substitute their own.
pub trait GenerationInvoker {
    fn generate(
        &self,
        request: &GenerationRequest,
        assets: &EngineAssets,
    ) -> Result<PathBuf, GenerationError>;
}

/// Weight files the engine loads for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineAssets {
    pub diffusion_model: PathBuf,
    pub vae: PathBuf,
    pub text_encoder: PathBuf,
}

impl EngineAssets {
    pub fn from_catalog(catalog: &AssetCatalog, root: &Path) -> Result<Self, CatalogError> {
        Ok(Self {
            diffusion_model: catalog.get(KEY_DIFFUSION)?.path(root),
            vae: catalog.get(KEY_VAE)?.path(root),
            text_encoder: catalog.get(KEY_TEXT_ENCODER)?.path(root),
        })
    }
}
