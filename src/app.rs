//! Install gate and prompt handling behind the `zimage-gen` binary.

use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use tracing::{error, info, warn};

use crate::{
    core::{
        events::EventSink,
        settings::{timestamp_now, Settings},
    },
    engine::{EngineAssets, GenerationInvoker, GenerationRequest, Seed},
    error::{Error, Result},
    models::{install, AssetCatalog, Fetcher, InstallationReport, InstallationVerifier},
};

pub const QUIT_WORDS: [&str; 3] = ["quit", "exit", "q"];

/// `Ok` only when every asset verifies.
pub fn require_complete(report: &InstallationReport) -> Result<()> {
    if report.all_valid() {
        return Ok(());
    }
    Err(Error::IncompleteInstall {
        missing: report.missing().map(|check| check.key.clone()).collect(),
        kind: None,
    })
}

pub fn run_install(
    catalog: &AssetCatalog,
    verifier: &InstallationVerifier,
    fetcher: &dyn Fetcher,
    events: &dyn EventSink,
) -> Result<()> {
    let outcome = install(catalog, verifier, fetcher, events);
    match Error::from_install(&outcome) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Installs whatever is missing, unless downloads are disabled, in which
/// case an incomplete cache is an error and nothing is fetched.
pub fn ensure_installed(
    catalog: &AssetCatalog,
    verifier: &InstallationVerifier,
    auto_download: bool,
    fetcher: &dyn Fetcher,
    events: &dyn EventSink,
) -> Result<()> {
    let report = verifier.check(catalog);
    if report.all_valid() || !auto_download {
        return require_complete(&report);
    }
    info!("Some assets are missing; downloading them now");
    run_install(catalog, verifier, fetcher, events)
}

/// Everything a generation needs besides the prompt.
pub struct Session<'a> {
    pub settings: &'a Settings,
    pub output_dir: &'a Path,
    pub invoker: &'a dyn GenerationInvoker,
    pub assets: &'a EngineAssets,
    pub cancel: &'a AtomicBool,
    pub seed: Seed,
    pub negative_prompt: Option<String>,
}

impl Session<'_> {
    /// Resolves the seed, names the output and applies the low-VRAM size cap.
    pub fn request(&self, prompt: &str, output: Option<PathBuf>) -> GenerationRequest {
        let seed = self.seed.resolve();
        let output = output.unwrap_or_else(|| {
            self.settings
                .output_path(self.output_dir, seed, &timestamp_now())
        });
        let mut request =
            GenerationRequest::from_settings(prompt, self.settings, Seed::Fixed(seed), output);
        request.negative_prompt = self.negative_prompt.clone();
        if self.settings.low_vram {
            let (width, height) = (request.width, request.height);
            if request.fit_to_low_vram() {
                warn!(
                    "{width}x{height} is too large for low-VRAM mode, using {}x{}",
                    request.width, request.height
                );
            }
        }
        request
    }

    pub fn generate(&self, prompt: &str, output: Option<PathBuf>) -> Result<PathBuf> {
        let request = self.request(prompt, output);
        match self.invoker.generate(&request, self.assets) {
            Ok(path) => Ok(path),
            // The engine shares our process group and dies on the same Ctrl-C.
            Err(_) if self.cancel.load(Ordering::SeqCst) => Err(Error::Cancelled),
            Err(error) => Err(error.into()),
        }
    }

    /// Reads prompts until a quit word or end of input. A failed generation
    /// is reported and the loop goes on; cancellation ends it.
    pub fn interactive<R, W>(&self, input: R, mut out: W) -> Result<()>
    where
        R: BufRead,
        W: Write,
    {
        writeln!(out, "Interactive mode. Type a prompt, or `quit` to leave.")
            .context("write to stdout")?;
        let mut lines = input.lines();
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            write!(out, "> ").context("write to stdout")?;
            out.flush().context("flush stdout")?;
            let Some(line) = lines.next() else {
                return Ok(());
            };
            let line = line.context("read prompt")?;
            let prompt = line.trim();
            if prompt.is_empty() {
                continue;
            }
            if QUIT_WORDS.contains(&prompt.to_ascii_lowercase().as_str()) {
                return Ok(());
            }
            match self.generate(prompt, None) {
                Ok(path) => writeln!(out, "{}", path.display()).context("write to stdout")?,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(error) => error!("{error}"),
            }
        }
    }
}
