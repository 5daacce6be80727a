use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::debug;

use super::{
    catalog::{AssetCatalog, AssetDescriptor},
    metadata::{checksum_matches, compute_sha256},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "kebab-case")]
pub enum AssetStatus {
    Valid,
    Invalid(String),
    Absent,
}

impl AssetStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, AssetStatus::Valid)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCheck {
    pub key: String,
    pub path: PathBuf,
    pub status: AssetStatus,
}

/// Per-asset status in catalog order. Recomputed from disk every time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallationReport {
    pub assets: Vec<AssetCheck>,
}

impl InstallationReport {
    pub fn status(&self, key: &str) -> Option<&AssetStatus> {
        self.assets
            .iter()
            .find(|check| check.key == key)
            .map(|check| &check.status)
    }

    pub fn all_valid(&self) -> bool {
        self.assets.iter().all(|check| check.status.is_valid())
    }

    pub fn missing(&self) -> impl Iterator<Item = &AssetCheck> {
        self.assets.iter().filter(|check| !check.status.is_valid())
    }
}

pub struct InstallationVerifier {
    root: PathBuf,
}

impl InstallationVerifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn check(&self, catalog: &AssetCatalog) -> InstallationReport {
        InstallationReport {
            assets: catalog
                .iter()
                .map(|asset| AssetCheck {
                    key: asset.key.clone(),
                    path: asset.path(&self.root),
                    status: self.check_asset(asset),
                })
                .collect(),
        }
    }

    /// Filesystem errors of any kind count as absent; this never errors.
    pub fn check_asset(&self, asset: &AssetDescriptor) -> AssetStatus {
        let path = asset.path(&self.root);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) => {
                debug!(key = %asset.key, path = %path.display(), "unreadable: {error}");
                return AssetStatus::Absent;
            }
        };
        if !metadata.is_file() {
            return AssetStatus::Invalid(format!("{} is not a regular file", path.display()));
        }
        let size = metadata.len();
        if size <= asset.min_valid_bytes {
            return AssetStatus::Invalid(format!(
                "{size} bytes is below the {} byte minimum",
                asset.min_valid_bytes
            ));
        }
        let Some(expected) = asset.checksum.as_deref() else {
            return AssetStatus::Valid;
        };
        match compute_sha256(&path) {
            Ok(actual) if checksum_matches(expected, &actual) => AssetStatus::Valid,
            Ok(actual) => AssetStatus::Invalid(format!(
                "checksum mismatch: expected {expected}, got {actual}"
            )),
            Err(error) => {
                debug!(key = %asset.key, "hashing failed: {error:#}");
                AssetStatus::Absent
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};

    use super::*;

    fn descriptor(key: &str, min_valid_bytes: u64, checksum: Option<String>) -> AssetDescriptor {
        AssetDescriptor {
            key: key.into(),
            name: key.into(),
            url: format!("https://example.invalid/{key}.gguf"),
            relative_path: PathBuf::from(format!("models/{key}.gguf")),
            approx_bytes: 0,
            checksum,
            archive: None,
            min_valid_bytes,
            recommended_tier: None,
        }
    }

    fn write(root: &Path, key: &str, bytes: &[u8]) {
        let path = root.join("models").join(format!("{key}.gguf"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn missing_file_is_absent() {
        let temp = tempfile::tempdir().unwrap();
        let catalog = AssetCatalog::new(vec![descriptor("weights", 10, None)]).unwrap();

        let report = InstallationVerifier::new(temp.path()).check(&catalog);
        assert_eq!(report.status("weights"), Some(&AssetStatus::Absent));
        assert!(!report.all_valid());
    }

    #[test]
    fn error_page_sized_file_is_not_valid() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "weights", &[b'<'; 500]);
        let catalog = AssetCatalog::new(vec![descriptor("weights", 1_000_000, None)]).unwrap();

        let status = InstallationVerifier::new(temp.path())
            .check(&catalog)
            .status("weights")
            .cloned();
        assert!(matches!(status, Some(AssetStatus::Invalid(_))));
    }

    #[test]
    fn file_above_threshold_without_hash_is_valid() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "weights", &[7u8; 64]);
        let catalog = AssetCatalog::new(vec![descriptor("weights", 32, None)]).unwrap();

        assert!(InstallationVerifier::new(temp.path())
            .check(&catalog)
            .all_valid());
    }

    #[test]
    fn declared_hash_decides_validity() {
        let temp = tempfile::tempdir().unwrap();
        let good = vec![1u8; 128];
        let bad = vec![2u8; 128];
        let hash = format!("{:x}", Sha256::digest(&good));
        write(temp.path(), "matching", &good);
        write(temp.path(), "tampered", &bad);
        let catalog = AssetCatalog::new(vec![
            descriptor("matching", 16, Some(hash.to_uppercase())),
            descriptor("tampered", 16, Some(hash)),
        ])
        .unwrap();

        let report = InstallationVerifier::new(temp.path()).check(&catalog);
        assert_eq!(report.status("matching"), Some(&AssetStatus::Valid));
        assert!(matches!(
            report.status("tampered"),
            Some(AssetStatus::Invalid(reason)) if reason.contains("checksum mismatch")
        ));
        assert_eq!(
            report.missing().map(|check| check.key.as_str()).collect::<Vec<_>>(),
            ["tampered"]
        );
    }

    #[test]
    fn directory_in_place_of_file_is_invalid() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("models/weights.gguf")).unwrap();
        let catalog = AssetCatalog::new(vec![descriptor("weights", 1, None)]).unwrap();

        let status =
            InstallationVerifier::new(temp.path()).check_asset(catalog.get("weights").unwrap());
        assert!(matches!(status, AssetStatus::Invalid(_)));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_with_hash_counts_as_absent() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "locked", &[3u8; 64]);
        let path = temp.path().join("models/locked.gguf");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::File::open(&path).is_ok() {
            // Running as root; permissions are not enforced.
            return;
        }
        let catalog =
            AssetCatalog::new(vec![descriptor("locked", 16, Some("00".repeat(32)))]).unwrap();

        let status =
            InstallationVerifier::new(temp.path()).check_asset(catalog.get("locked").unwrap());
        assert_eq!(status, AssetStatus::Absent);
    }
}
