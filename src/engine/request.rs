use std::path::PathBuf;

use rand::Rng;
use serde::Serialize;

use super::GenerationError;
use crate::core::settings::Settings;

const MAX_RANDOM_SEED: u64 = 999_999;
/// 768x512 is the largest frame that fits a 4GB card comfortably.
const LOW_VRAM_PIXEL_BUDGET: f64 = 768.0 * 512.0;
const PIXEL_BUDGET_TOLERANCE: f64 = 1.1;
const DIMENSION_STEP: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Seed {
    Random,
    Fixed(u64),
}

impl Seed {
    /// Negative values mean "pick one for me".
    pub fn from_signed(value: i64) -> Self {
        u64::try_from(value).map_or(Seed::Random, Seed::Fixed)
    }

    pub fn resolve(self) -> u64 {
        match self {
            Seed::Fixed(seed) => seed,
            Seed::Random => rand::thread_rng().gen_range(0..=MAX_RANDOM_SEED),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub seed: Seed,
    pub cfg_scale: f32,
    pub sampler: String,
    pub output: PathBuf,
}

impl GenerationRequest {
    pub fn from_settings(
        prompt: impl Into<String>,
        settings: &Settings,
        seed: Seed,
        output: PathBuf,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: settings.width,
            height: settings.height,
            steps: settings.steps,
            seed,
            cfg_scale: settings.cfg_scale,
            sampler: settings.sampler.clone(),
            output,
        }
    }

    /// The seed, if the caller already picked one.
    pub fn fixed_seed(&self) -> Option<u64> {
        match self.seed {
            Seed::Fixed(seed) => Some(seed),
            Seed::Random => None,
        }
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest("prompt is empty".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(GenerationError::InvalidRequest(format!(
                "invalid size {}x{}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(GenerationError::InvalidRequest(
                "steps must be at least 1".into(),
            ));
        }
        if self.fixed_seed().is_none() {
            return Err(GenerationError::InvalidRequest(
                "seed must be resolved before invoking the engine".into(),
            ));
        }
        Ok(())
    }

    /// Shrinks the frame to the low-VRAM pixel budget, keeping the aspect
    /// ratio. Returns `true` when the size changed.
    pub fn fit_to_low_vram(&mut self) -> bool {
        let (width, height, adjusted) = fit_to_pixel_budget(self.width, self.height);
        self.width = width;
        self.height = height;
        adjusted
    }
}

pub fn fit_to_pixel_budget(width: u32, height: u32) -> (u32, u32, bool) {
    let pixels = f64::from(width) * f64::from(height);
    if pixels <= LOW_VRAM_PIXEL_BUDGET * PIXEL_BUDGET_TOLERANCE {
        return (width, height, false);
    }
    let scale = (LOW_VRAM_PIXEL_BUDGET / pixels).sqrt();
    let shrink = |value: u32| {
        let scaled = (f64::from(value) * scale) as u32;
        (scaled / DIMENSION_STEP * DIMENSION_STEP).max(DIMENSION_STEP)
    };
    (shrink(width), shrink(height), true)
}
