use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};
use tracing::warn;

use crate::models::ModelVariant;

const DEFAULT_FILENAME_TEMPLATE: &str = "zimage_{seed}_{timestamp}";
const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 900;

const ENV_MODEL_TYPE: &str = "Z_IMAGE_MODEL_TYPE";
const ENV_WIDTH: &str = "Z_IMAGE_WIDTH";
const ENV_HEIGHT: &str = "Z_IMAGE_HEIGHT";
const ENV_STEPS: &str = "Z_IMAGE_STEPS";
const ENV_OUTPUT_DIR: &str = "Z_IMAGE_OUTPUT_DIR";
const ENV_LOW_VRAM: &str = "Z_IMAGE_LOW_VRAM";
const ENV_CUDA: &str = "Z_IMAGE_CUDA";
const ENV_VERBOSE: &str = "Z_IMAGE_VERBOSE";
const ENV_ENGINE: &str = "ZIMAGE_ENGINE";
const ENV_ENGINE_ARGS: &str = "ZIMAGE_ENGINE_ARGS";

/// Defaults are tuned for Z-Image-Turbo on a 4GB card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub model_variant: ModelVariant,
    pub auto_download: bool,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub sampler: String,
    pub output_dir: Option<PathBuf>,
    pub filename_template: String,
    pub low_vram: bool,
    pub vae_on_cpu: bool,
    pub use_cuda: bool,
    pub verbose: bool,
    pub engine_path: Option<PathBuf>,
    pub engine_search_paths: Vec<PathBuf>,
    /// Passed before the generation arguments, e.g. a wrapper script.
    pub engine_args: Vec<String>,
    pub engine_archive_url: Option<String>,
    pub generation_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_variant: ModelVariant::default(),
            auto_download: true,
            width: 768,
            height: 512,
            steps: 4,
            cfg_scale: 0.0,
            sampler: "euler_a".into(),
            output_dir: None,
            filename_template: DEFAULT_FILENAME_TEMPLATE.into(),
            low_vram: true,
            vae_on_cpu: true,
            use_cuda: true,
            verbose: false,
            engine_path: None,
            engine_search_paths: Vec::new(),
            engine_args: Vec::new(),
            engine_archive_url: None,
            generation_timeout_secs: Some(DEFAULT_GENERATION_TIMEOUT_SECS),
        }
    }
}

impl Settings {
    /// Reads `path`, writing the defaults there first if it does not exist.
    /// A corrupt file is reported and the defaults are used instead.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let settings = Self::default();
            persist_settings(path, &settings)?;
            return Ok(settings);
        }
        match load_settings(path) {
            Ok(settings) => Ok(settings),
            Err(error) => {
                warn!("Ignoring unreadable config {}: {error:#}", path.display());
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        persist_settings(path, self)
    }

    pub fn apply_process_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Applies the `Z_IMAGE_*` overrides. Values that do not parse are
    /// skipped with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MODEL_TYPE) {
            match value.parse::<ModelVariant>() {
                Ok(variant) => self.model_variant = variant,
                Err(error) => warn!("{ENV_MODEL_TYPE}: {error}"),
            }
        }
        override_parsed(&lookup, ENV_WIDTH, &mut self.width);
        override_parsed(&lookup, ENV_HEIGHT, &mut self.height);
        override_parsed(&lookup, ENV_STEPS, &mut self.steps);
        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|value| !value.trim().is_empty()) {
            self.output_dir = Some(PathBuf::from(dir));
        }
        override_flag(&lookup, ENV_LOW_VRAM, &mut self.low_vram);
        override_flag(&lookup, ENV_CUDA, &mut self.use_cuda);
        override_flag(&lookup, ENV_VERBOSE, &mut self.verbose);
        if let Some(engine) = lookup(ENV_ENGINE).filter(|value| !value.trim().is_empty()) {
            self.engine_path = Some(PathBuf::from(engine));
        }
        if let Some(args) = lookup(ENV_ENGINE_ARGS) {
            self.engine_args = args.split_whitespace().map(|s| s.to_string()).collect();
        }
    }

    pub fn resolved_output_dir(&self, default_dir: &Path) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| default_dir.to_path_buf())
    }

    /// `<template>.png` under `output_dir`, e.g. `zimage_42_20240101_000000.png`.
    pub fn output_path(&self, output_dir: &Path, seed: u64, timestamp: &str) -> PathBuf {
        let filename = self
            .filename_template
            .replace("{seed}", &seed.to_string())
            .replace("{timestamp}", timestamp);
        output_dir.join(format!("{filename}.png"))
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        self.generation_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Local wall clock as `YYYYMMDD_HHMMSS`, UTC when the offset is unknown.
pub fn timestamp_now() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_timestamp(now)
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    let format = format_description!("[year][month][day]_[hour][minute][second]");
    at.format(format)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn override_parsed<F>(lookup: &F, key: &str, target: &mut u32)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        match value.trim().parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(error) => warn!("{key}={value:?} ignored: {error}"),
        }
    }
}

fn override_flag<F>(lookup: &F, key: &str, target: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        *target = value.trim().eq_ignore_ascii_case("true");
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("config json could not be parsed")
}

fn persist_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use time::macros::datetime;

    use super::*;

    #[test]
    fn defaults_match_turbo_low_vram_profile() {
        let settings = Settings::default();
        assert_eq!(settings.model_variant, ModelVariant::Q4_0);
        assert_eq!((settings.width, settings.height), (768, 512));
        assert_eq!(settings.steps, 4);
        assert_eq!(settings.cfg_scale, 0.0);
        assert!(settings.low_vram);
        assert!(settings.vae_on_cpu);
    }

    #[test]
    fn output_path_embeds_seed_and_timestamp() {
        let settings = Settings::default();
        let path = settings.output_path(Path::new("/tmp/out"), 42, "20240101_000000");
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some("zimage_42_20240101_000000.png")
        );
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("png"));
        assert_eq!(path.parent(), Some(Path::new("/tmp/out")));
    }

    #[test]
    fn timestamp_format_is_compact() {
        let at = datetime!(2024-01-01 0:00:00 UTC);
        assert_eq!(format_timestamp(at), "20240101_000000");
        let at = datetime!(2025-12-31 23:59:07 UTC);
        assert_eq!(format_timestamp(at), "20251231_235907");
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("Z_IMAGE_WIDTH", "1024"),
            ("Z_IMAGE_HEIGHT", "576"),
            ("Z_IMAGE_STEPS", "eight"),
            ("Z_IMAGE_MODEL_TYPE", "q8_0"),
            ("Z_IMAGE_LOW_VRAM", "false"),
            ("Z_IMAGE_OUTPUT_DIR", "/srv/images"),
            ("ZIMAGE_ENGINE_ARGS", "nice  -n 10"),
        ]);
        let mut settings = Settings::default();
        settings.apply_env(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(settings.width, 1024);
        assert_eq!(settings.height, 576);
        assert_eq!(settings.steps, 4);
        assert_eq!(settings.model_variant, ModelVariant::Q8_0);
        assert!(!settings.low_vram);
        assert_eq!(settings.output_dir, Some(PathBuf::from("/srv/images")));
        assert_eq!(settings.engine_args, ["nice", "-n", "10"]);
    }

    #[test]
    fn load_or_init_writes_defaults_then_reads_them_back() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let first = Settings::load_or_init(&path).unwrap();
        assert!(path.exists());

        let mut edited = first.clone();
        edited.steps = 8;
        edited.save(&path).unwrap();

        let second = Settings::load_or_init(&path).unwrap();
        assert_eq!(second.steps, 8);
    }

    #[test]
    fn partial_config_keeps_defaults_for_missing_keys() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, br#"{ "width": 640, "modelVariant": "q5_0" }"#).unwrap();

        let settings = Settings::load_or_init(&path).unwrap();
        assert_eq!(settings.width, 640);
        assert_eq!(settings.height, 512);
        assert_eq!(settings.model_variant, ModelVariant::Q5_0);
    }

    #[test]
    fn corrupt_config_falls_back_to_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, b"{ not json").unwrap();

        let settings = Settings::load_or_init(&path).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
