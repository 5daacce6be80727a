//! Text-to-image generation on top of stable-diffusion.cpp, with first-run
//! download and verification of the Z-Image-Turbo weights and the engine.

pub mod app;
pub mod cli;
pub mod core;
pub mod engine;
pub mod error;
pub mod models;

pub use error::{Error, Result};
