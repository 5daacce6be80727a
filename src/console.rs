use std::{
    io::{self, Write},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use zimage_gen::core::events::{EventSink, PipelineEvent};

const REDRAW_INTERVAL: Duration = Duration::from_millis(200);

/// Renders install events on stderr with a single in-place progress line.
pub struct ConsoleSink {
    progress: Mutex<ProgressLine>,
}

#[derive(Default)]
struct ProgressLine {
    last_draw: Option<Instant>,
    open: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            progress: Mutex::new(ProgressLine::default()),
        }
    }

    fn line(&self, text: String) {
        let mut progress = self.progress.lock();
        if progress.open {
            eprintln!();
            progress.open = false;
        }
        progress.last_draw = None;
        eprintln!("{text}");
    }

    fn draw_progress(&self, downloaded: u64, total: u64) {
        let mut progress = self.progress.lock();
        let finished = total > 0 && downloaded >= total;
        if let Some(last) = progress.last_draw {
            if !finished && last.elapsed() < REDRAW_INTERVAL {
                return;
            }
        }
        progress.last_draw = Some(Instant::now());
        progress.open = true;
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r  {:<40}", render_progress(downloaded, total));
        let _ = stderr.flush();
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::InstallStarted { total_assets } => {
                self.line(format!("Checking {total_assets} assets"))
            }
            PipelineEvent::AssetSkipped { key } => self.line(format!("  {key}: already installed")),
            PipelineEvent::DownloadStarted {
                name, approx_bytes, ..
            } => self.line(format!("Downloading {name} (~{})", format_bytes(approx_bytes))),
            PipelineEvent::DownloadProgress {
                downloaded, total, ..
            } => self.draw_progress(downloaded, total),
            PipelineEvent::DownloadFinished { bytes, .. } => {
                self.line(format!("  received {}", format_bytes(bytes)))
            }
            PipelineEvent::Extracting { archive, .. } => {
                let name = archive
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| archive.display().to_string());
                self.line(format!("  extracting {name}"))
            }
            PipelineEvent::AssetInstalled { key } => self.line(format!("  {key}: installed")),
            PipelineEvent::AssetFailed { key, reason } => {
                self.line(format!("  {key}: failed: {reason}"))
            }
            PipelineEvent::AssetCancelled { key } => self.line(format!("  {key}: cancelled")),
            PipelineEvent::InstallFinished { success } => self.line(
                if success {
                    "All assets ready"
                } else {
                    "Installation incomplete"
                }
                .to_string(),
            ),
        }
    }
}

/// Percentage when the size is known, a running byte count otherwise.
pub fn render_progress(downloaded: u64, total: u64) -> String {
    if total == 0 {
        return format_bytes(downloaded);
    }
    let percent = downloaded as f64 / total as f64 * 100.0;
    format!(
        "{percent:5.1}% {} / {}",
        format_bytes(downloaded),
        format_bytes(total)
    )
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}
