use std::path::PathBuf;

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Everything the install pipeline reports. Presentation layers subscribe
/// through an [`EventSink`]; the pipeline itself never prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PipelineEvent {
    InstallStarted {
        total_assets: usize,
    },
    AssetSkipped {
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    DownloadStarted {
        key: String,
        name: String,
        url: String,
        approx_bytes: u64,
    },
    DownloadProgress {
        key: String,
        downloaded: u64,
        total: u64,
    },
    DownloadFinished {
        key: String,
        bytes: u64,
    },
    Extracting {
        key: String,
        archive: PathBuf,
    },
    AssetInstalled {
        key: String,
    },
    AssetFailed {
        key: String,
        reason: String,
    },
    AssetCancelled {
        key: String,
    },
    InstallFinished {
        success: bool,
    },
}

pub trait EventSink {
    fn emit(&self, event: PipelineEvent);
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Mirrors events into the log; progress ticks go to `debug`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::DownloadProgress {
                key,
                downloaded,
                total,
            } => debug!(key, downloaded, total, "download progress"),
            PipelineEvent::AssetFailed { key, reason } => warn!(key, "install failed: {reason}"),
            PipelineEvent::AssetCancelled { key } => warn!(key, "install cancelled"),
            other => info!(?other, "install"),
        }
    }
}

/// Forwards events to a channel, e.g. for a UI thread. A disconnected
/// receiver is ignored.
pub struct ChannelSink {
    sender: Sender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<PipelineEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}
