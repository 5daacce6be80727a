use std::{fs, path::Path};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    catalog::{AssetCatalog, AssetDescriptor},
    download::{extract_archive, partial_path, DownloadError, ExtractionError, Fetcher},
    verify::{AssetStatus, InstallationReport, InstallationVerifier},
};
use crate::core::events::{EventSink, PipelineEvent};

#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("installed file failed verification: {0}")]
    Verification(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Transfer,
    Extraction,
    Verification,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallFailure {
    pub key: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub success: bool,
    pub cancelled: bool,
    pub failures: Vec<InstallFailure>,
    /// Verifier output taken after every asset was processed.
    pub report: InstallationReport,
}

/// Verifies each asset and fetches (and extracts) the ones that are not
/// valid, strictly one at a time in catalog order. A failed asset does not
/// stop the others; cancellation does.
pub fn install(
    catalog: &AssetCatalog,
    verifier: &InstallationVerifier,
    fetcher: &dyn Fetcher,
    events: &dyn EventSink,
) -> InstallOutcome {
    events.emit(PipelineEvent::InstallStarted {
        total_assets: catalog.len(),
    });

    let mut failures = Vec::new();
    let mut cancelled = false;
    for asset in catalog.iter() {
        let status = verifier.check_asset(asset);
        if status.is_valid() {
            debug!(key = %asset.key, "already installed");
            events.emit(PipelineEvent::AssetSkipped {
                key: asset.key.clone(),
            });
            continue;
        }
        info!(key = %asset.key, ?status, "installing {}", asset.name);

        match install_asset(asset, verifier, fetcher, events) {
            Ok(()) => events.emit(PipelineEvent::AssetInstalled {
                key: asset.key.clone(),
            }),
            Err(StepError::Download(DownloadError::Cancelled { .. })) => {
                events.emit(PipelineEvent::AssetCancelled {
                    key: asset.key.clone(),
                });
                cancelled = true;
                break;
            }
            Err(error) => {
                warn!(key = %asset.key, "install failed: {error}");
                events.emit(PipelineEvent::AssetFailed {
                    key: asset.key.clone(),
                    reason: error.to_string(),
                });
                failures.push(InstallFailure {
                    key: asset.key.clone(),
                    kind: failure_kind(&error),
                    reason: error.to_string(),
                });
            }
        }
    }

    let report = verifier.check(catalog);
    let success = !cancelled && failures.is_empty() && report.all_valid();
    events.emit(PipelineEvent::InstallFinished { success });
    InstallOutcome {
        success,
        cancelled,
        failures,
        report,
    }
}

fn install_asset(
    asset: &AssetDescriptor,
    verifier: &InstallationVerifier,
    fetcher: &dyn Fetcher,
    events: &dyn EventSink,
) -> Result<(), StepError> {
    let root = verifier.root();
    let download_path = asset.download_path(root);
    // Left behind only if a previous run was killed outright.
    let _ = fs::remove_file(partial_path(&download_path));

    events.emit(PipelineEvent::DownloadStarted {
        key: asset.key.clone(),
        name: asset.name.clone(),
        url: asset.url.clone(),
        approx_bytes: asset.approx_bytes,
    });
    let bytes = fetcher.fetch(&asset.url, &download_path, &mut |downloaded, total| {
        events.emit(PipelineEvent::DownloadProgress {
            key: asset.key.clone(),
            downloaded,
            total,
        })
    })?;
    events.emit(PipelineEvent::DownloadFinished {
        key: asset.key.clone(),
        bytes,
    });

    if let Some(archive) = &asset.archive {
        events.emit(PipelineEvent::Extracting {
            key: asset.key.clone(),
            archive: download_path.clone(),
        });
        let extracted = extract_archive(
            archive.format,
            &download_path,
            &root.join(&archive.extract_dir),
            archive.strip_prefix_components,
        );
        let _ = fs::remove_file(&download_path);
        extracted?;
    }

    match verifier.check_asset(asset) {
        AssetStatus::Valid => Ok(()),
        AssetStatus::Invalid(reason) => {
            discard_plain_download(asset, &download_path);
            Err(StepError::Verification(reason))
        }
        AssetStatus::Absent => Err(StepError::Verification(format!(
            "{} missing after install",
            asset.relative_path.display()
        ))),
    }
}

fn discard_plain_download(asset: &AssetDescriptor, path: &Path) {
    if asset.archive.is_none() {
        if let Err(error) = fs::remove_file(path) {
            debug!(path = %path.display(), "could not remove rejected download: {error}");
        }
    }
}

fn failure_kind(error: &StepError) -> FailureKind {
    match error {
        StepError::Download(_) => FailureKind::Transfer,
        StepError::Extraction(_) => FailureKind::Extraction,
        StepError::Verification(_) => FailureKind::Verification,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        collections::HashMap,
        path::{Path, PathBuf},
    };

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::{
        core::events::{ChannelSink, NullSink},
        models::catalog::{ArchiveFormat, ArchiveSpec},
    };

    enum Reply {
        Bytes(Vec<u8>),
        Fail,
        Cancel,
    }

    /// Serves canned replies by URL and records every call.
    struct FakeFetcher {
        replies: HashMap<String, Reply>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeFetcher {
        fn new(replies: Vec<(&str, Reply)>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|(url, reply)| (url.to_string(), reply))
                    .collect(),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl Fetcher for FakeFetcher {
        fn fetch(
            &self,
            url: &str,
            destination: &Path,
            progress: &mut dyn FnMut(u64, u64),
        ) -> Result<u64, DownloadError> {
            self.calls.borrow_mut().push(url.to_string());
            match self.replies.get(url) {
                Some(Reply::Bytes(bytes)) => {
                    fs::create_dir_all(destination.parent().unwrap()).unwrap();
                    fs::write(destination, bytes).unwrap();
                    progress(bytes.len() as u64, bytes.len() as u64);
                    Ok(bytes.len() as u64)
                }
                Some(Reply::Cancel) => Err(DownloadError::Cancelled { url: url.into() }),
                Some(Reply::Fail) | None => Err(DownloadError::Transfer {
                    url: url.into(),
                    reason: "connection reset".into(),
                }),
            }
        }
    }

    fn plain(key: &str) -> AssetDescriptor {
        AssetDescriptor {
            key: key.into(),
            name: key.into(),
            url: format!("https://example.invalid/{key}"),
            relative_path: PathBuf::from(format!("models/{key}.bin")),
            approx_bytes: 64,
            checksum: None,
            archive: None,
            min_valid_bytes: 16,
            recommended_tier: None,
        }
    }

    fn zip_asset(key: &str) -> AssetDescriptor {
        AssetDescriptor {
            relative_path: PathBuf::from("bin/tool"),
            archive: Some(ArchiveSpec {
                format: ArchiveFormat::Zip,
                extract_dir: PathBuf::from("bin"),
                strip_prefix_components: 0,
            }),
            url: format!("https://example.invalid/{key}.zip"),
            ..plain(key)
        }
    }

    #[test]
    fn valid_assets_are_skipped_without_fetching() {
        let temp = tempfile::tempdir().unwrap();
        let catalog = AssetCatalog::new(vec![plain("a"), plain("b")]).unwrap();
        for key in ["a", "b"] {
            let path = temp.path().join(format!("models/{key}.bin"));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, [0u8; 32]).unwrap();
        }
        let fetcher = FakeFetcher::new(vec![]);

        let outcome = install(
            &catalog,
            &InstallationVerifier::new(temp.path()),
            &fetcher,
            &NullSink,
        );

        assert!(outcome.success);
        assert!(fetcher.calls().is_empty());
    }

    #[test]
    fn one_failed_asset_does_not_stop_the_rest() {
        let temp = tempfile::tempdir().unwrap();
        let catalog = AssetCatalog::new(vec![plain("a"), plain("b"), plain("c")]).unwrap();
        let fetcher = FakeFetcher::new(vec![
            ("https://example.invalid/a", Reply::Bytes(vec![1; 32])),
            ("https://example.invalid/b", Reply::Fail),
            ("https://example.invalid/c", Reply::Bytes(vec![3; 32])),
        ]);

        let outcome = install(
            &catalog,
            &InstallationVerifier::new(temp.path()),
            &fetcher,
            &NullSink,
        );

        assert!(!outcome.success);
        assert_eq!(fetcher.calls().len(), 3);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].key, "b");
        assert_eq!(outcome.failures[0].kind, FailureKind::Transfer);
        assert_eq!(outcome.report.status("a"), Some(&AssetStatus::Valid));
        assert_eq!(outcome.report.status("b"), Some(&AssetStatus::Absent));
        assert_eq!(outcome.report.status("c"), Some(&AssetStatus::Valid));
    }

    #[test]
    fn corrupt_archive_is_reported_and_discarded() {
        let temp = tempfile::tempdir().unwrap();
        let catalog = AssetCatalog::new(vec![zip_asset("tool"), plain("after")]).unwrap();
        let fetcher = FakeFetcher::new(vec![
            (
                "https://example.invalid/tool.zip",
                Reply::Bytes(b"<html>404</html>".to_vec()),
            ),
            ("https://example.invalid/after", Reply::Bytes(vec![9; 32])),
        ]);

        let outcome = install(
            &catalog,
            &InstallationVerifier::new(temp.path()),
            &fetcher,
            &NullSink,
        );

        assert!(!outcome.success);
        assert_eq!(outcome.failures[0].kind, FailureKind::Extraction);
        assert!(!temp.path().join("bin/tool.zip").exists());
        assert_eq!(outcome.report.status("after"), Some(&AssetStatus::Valid));
    }

    #[test]
    fn cancellation_stops_remaining_assets() {
        let temp = tempfile::tempdir().unwrap();
        let catalog = AssetCatalog::new(vec![plain("a"), plain("b"), plain("c")]).unwrap();
        let fetcher = FakeFetcher::new(vec![
            ("https://example.invalid/a", Reply::Bytes(vec![1; 32])),
            ("https://example.invalid/b", Reply::Cancel),
        ]);
        let (sender, receiver) = unbounded();

        let outcome = install(
            &catalog,
            &InstallationVerifier::new(temp.path()),
            &fetcher,
            &ChannelSink::new(sender),
        );

        assert!(outcome.cancelled);
        assert!(!outcome.success);
        assert!(outcome.failures.is_empty());
        assert_eq!(
            fetcher.calls(),
            ["https://example.invalid/a", "https://example.invalid/b"]
        );
        let events: Vec<_> = receiver.try_iter().collect();
        assert!(events.contains(&PipelineEvent::AssetCancelled { key: "b".into() }));
        assert_eq!(
            events.last(),
            Some(&PipelineEvent::InstallFinished { success: false })
        );
    }

    #[test]
    fn undersized_download_is_rejected_and_removed() {
        let temp = tempfile::tempdir().unwrap();
        let catalog = AssetCatalog::new(vec![plain("a")]).unwrap();
        let fetcher = FakeFetcher::new(vec![(
            "https://example.invalid/a",
            Reply::Bytes(b"Not Found".to_vec()),
        )]);

        let outcome = install(
            &catalog,
            &InstallationVerifier::new(temp.path()),
            &fetcher,
            &NullSink,
        );

        assert!(!outcome.success);
        assert_eq!(outcome.failures[0].kind, FailureKind::Verification);
        assert!(!temp.path().join("models/a.bin").exists());
    }

    #[test]
    fn progress_is_forwarded_as_events() {
        let temp = tempfile::tempdir().unwrap();
        let catalog = AssetCatalog::new(vec![plain("a")]).unwrap();
        let fetcher = FakeFetcher::new(vec![(
            "https://example.invalid/a",
            Reply::Bytes(vec![5; 40]),
        )]);
        let (sender, receiver) = unbounded();

        install(
            &catalog,
            &InstallationVerifier::new(temp.path()),
            &fetcher,
            &ChannelSink::new(sender),
        );

        let events: Vec<_> = receiver.try_iter().collect();
        assert_eq!(events[0], PipelineEvent::InstallStarted { total_assets: 1 });
        assert!(events.contains(&PipelineEvent::DownloadProgress {
            key: "a".into(),
            downloaded: 40,
            total: 40,
        }));
        assert!(events.contains(&PipelineEvent::AssetInstalled { key: "a".into() }));
    }
}
