//! Command line surface for `zimage-gen`.

use std::path::PathBuf;

use clap::Parser;

use crate::{core::settings::Settings, engine::Seed, models::ModelVariant};

/// Generate images from text with Z-Image-Turbo on stable-diffusion.cpp
#[derive(Parser, Debug, Clone)]
#[command(name = "zimage-gen", author, version, about, long_about = None)]
pub struct Cli {
    /// Text prompt describing the image
    pub prompt: Option<String>,

    /// Things the image should not contain
    #[arg(short = 'n', long)]
    pub negative_prompt: Option<String>,

    /// Image width in pixels
    #[arg(short = 'w', long)]
    pub width: Option<u32>,

    /// Image height in pixels
    #[arg(short = 'H', long)]
    pub height: Option<u32>,

    /// Sampling steps
    #[arg(short = 's', long)]
    pub steps: Option<u32>,

    /// Seed; negative picks a random one
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub seed: i64,

    /// Guidance scale
    #[arg(long)]
    pub cfg_scale: Option<f32>,

    /// Diffusion weight quantization (q4_0, q5_0, q8_0)
    #[arg(short = 'm', long)]
    pub model: Option<ModelVariant>,

    /// Exact output file
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Directory for generated images
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Where models and the engine are stored
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Prompt repeatedly until `quit`
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Download missing models and the engine, then exit
    #[arg(long, visible_alias = "download-model")]
    pub install: bool,

    /// Report which assets are installed
    #[arg(long)]
    pub check: bool,

    /// List the available quantizations
    #[arg(long)]
    pub list_models: bool,

    /// Delete one installed asset (diffusion, vae, text-encoder, engine)
    #[arg(long, value_name = "KEY")]
    pub remove: Option<String>,

    /// Show paths and system information
    #[arg(long)]
    pub info: bool,

    /// Fail instead of downloading missing assets
    #[arg(long)]
    pub no_download: bool,

    /// Debug logging and verbose engine output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Cli {
    pub fn seed(&self) -> Seed {
        Seed::from_signed(self.seed)
    }

    /// Flags given on the command line win over config and environment.
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(steps) = self.steps {
            settings.steps = steps;
        }
        if let Some(cfg_scale) = self.cfg_scale {
            settings.cfg_scale = cfg_scale;
        }
        if let Some(model) = self.model {
            settings.model_variant = model;
        }
        if let Some(dir) = &self.output_dir {
            settings.output_dir = Some(dir.clone());
        }
        if self.no_download {
            settings.auto_download = false;
        }
        if self.verbose {
            settings.verbose = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("zimage-gen").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn seed_defaults_to_random_and_accepts_negative() {
        assert_eq!(parse(&["a cat"]).seed(), Seed::Random);
        assert_eq!(parse(&["a cat", "--seed", "-5"]).seed(), Seed::Random);
        assert_eq!(parse(&["a cat", "--seed", "42"]).seed(), Seed::Fixed(42));
    }

    #[test]
    fn download_model_is_an_alias_for_install() {
        assert!(parse(&["--download-model"]).install);
        assert!(parse(&["--install"]).install);
    }

    #[test]
    fn model_flag_parses_variant_and_rejects_unknown() {
        assert_eq!(parse(&["-m", "Q8_0"]).model, Some(ModelVariant::Q8_0));
        assert!(Cli::try_parse_from(["zimage-gen", "-m", "q2_k"]).is_err());
    }

    #[test]
    fn flags_override_settings_only_when_given() {
        let mut settings = Settings::default();
        parse(&["x", "-w", "1024", "-s", "8", "--no-download", "-v"]).apply_to(&mut settings);

        assert_eq!(settings.width, 1024);
        assert_eq!(settings.height, 512);
        assert_eq!(settings.steps, 8);
        assert!(!settings.auto_download);
        assert!(settings.verbose);
    }

    #[test]
    fn remove_takes_an_asset_key() {
        assert_eq!(parse(&["--remove", "vae"]).remove.as_deref(), Some("vae"));
        assert_eq!(parse(&["a cat"]).remove, None);
        assert!(Cli::try_parse_from(["zimage-gen", "--remove"]).is_err());
    }

    #[test]
    fn short_flags_map_to_dimensions() {
        let cli = parse(&["prompt", "-w", "640", "-H", "480", "-n", "blur"]);
        assert_eq!((cli.width, cli.height), (Some(640), Some(480)));
        assert_eq!(cli.negative_prompt.as_deref(), Some("blur"));
    }
}
