use std::{
    ffi::OsString,
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use super::{EngineAssets, GenerationError, GenerationInvoker, GenerationRequest};
use crate::core::{paths::first_existing, settings::Settings};

/// Bumped whenever the flags passed to the engine change shape.
pub const ARG_CONTRACT_VERSION: u32 = 1;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub low_vram: bool,
    pub vae_on_cpu: bool,
    pub verbose: bool,
}

impl From<&Settings> for EngineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            low_vram: settings.low_vram,
            vae_on_cpu: settings.vae_on_cpu,
            verbose: settings.verbose,
        }
    }
}

/// Runs the stable-diffusion.cpp `sd` executable as a child process.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    program: PathBuf,
    leading_args: Vec<String>,
    options: EngineOptions,
    timeout: Option<Duration>,
}

impl CommandInvoker {
    pub fn new(program: PathBuf, options: EngineOptions) -> Result<Self, GenerationError> {
        if !program.is_file() {
            return Err(GenerationError::EngineNotFound {
                searched: vec![program],
            });
        }
        Ok(Self {
            program,
            leading_args: Vec::new(),
            options,
            timeout: None,
        })
    }

    /// Picks the first candidate that exists on disk.
    pub fn locate(candidates: &[PathBuf], options: EngineOptions) -> Result<Self, GenerationError> {
        let program = first_existing(candidates).ok_or_else(|| GenerationError::EngineNotFound {
            searched: candidates.to_vec(),
        })?;
        debug!(engine = %program.display(), "engine located");
        Self::new(program, options)
    }

    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(
        &self,
        request: &GenerationRequest,
        assets: &EngineAssets,
        seed: u64,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.leading_args.iter().map(OsString::from).collect();
        let mut push = |flag: &str, value: OsString| {
            args.push(flag.into());
            args.push(value);
        };
        push("--diffusion-model", assets.diffusion_model.clone().into());
        push("--vae", assets.vae.clone().into());
        push("--llm", assets.text_encoder.clone().into());
        push("-p", request.prompt.clone().into());
        if let Some(negative) = request
            .negative_prompt
            .as_deref()
            .filter(|text| !text.trim().is_empty())
        {
            push("-n", negative.into());
        }
        push("-W", request.width.to_string().into());
        push("-H", request.height.to_string().into());
        push("--steps", request.steps.to_string().into());
        push("-s", seed.to_string().into());
        push("--cfg-scale", request.cfg_scale.to_string().into());
        push("--sampling-method", request.sampler.clone().into());
        push("-o", request.output.clone().into());

        if self.options.low_vram {
            args.extend(["--offload-to-cpu", "--diffusion-fa", "--vae-tiling"].map(OsString::from));
        }
        if self.options.vae_on_cpu {
            args.push("--vae-on-cpu".into());
        }
        if self.options.verbose {
            args.push("-v".into());
        }
        args
    }

    fn run(&self, args: &[OsString]) -> Result<(), GenerationError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(if self.options.verbose {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| GenerationError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stderr = drain_stderr(&mut child);

        // On timeout the reader thread is left detached; a grandchild may
        // still hold the pipe open.
        let status = self.wait(&mut child)?;
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .map(|bytes| tail(&bytes))
            .unwrap_or_default();

        if !status.success() {
            return Err(GenerationError::Failed {
                code: status.code(),
                stderr,
            });
        }
        Ok(())
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, GenerationError> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(|source| GenerationError::Io {
                action: "poll engine process",
                path: self.program.clone(),
                source,
            })? {
                return Ok(status);
            }

            if let Some(timeout) = self.timeout {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GenerationError::Timeout(timeout));
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl GenerationInvoker for CommandInvoker {
    fn generate(
        &self,
        request: &GenerationRequest,
        assets: &EngineAssets,
    ) -> Result<PathBuf, GenerationError> {
        request.validate()?;
        let seed = request.fixed_seed().unwrap_or_default();
        if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| GenerationError::Io {
                action: "create output directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let args = self.args(request, assets, seed);
        debug!(
            engine = %self.program.display(),
            contract = ARG_CONTRACT_VERSION,
            "engine arguments: {args:?}"
        );
        info!(
            "Generating {}x{} image, {} steps, seed {seed}",
            request.width, request.height, request.steps
        );
        let start = Instant::now();
        self.run(&args)?;

        if !request.output.is_file() {
            return Err(GenerationError::NoOutput(request.output.clone()));
        }
        info!(
            "Image written to {} in {:.1}s",
            request.output.display(),
            start.elapsed().as_secs_f32()
        );
        Ok(request.output.clone())
    }
}

/// The engine logs heavily to stderr; reading it off-thread keeps a full
/// pipe from stalling the child while we poll.
fn drain_stderr(child: &mut Child) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = child.stderr.take()?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(error) = pipe.read_to_end(&mut buf) {
            warn!("failed reading engine stderr: {error}");
        }
        buf
    }))
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}
