use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::{BaseDirs, ProjectDirs, UserDirs};

pub const APP_NAME: &str = "z-image-gen";
const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "FedoRScorpioN";
const ENV_CACHE_DIR: &str = "ZIMAGE_CACHE_DIR";
const CONFIG_FILE: &str = "config.json";

#[cfg(windows)]
pub const ENGINE_BINARY: &str = "sd.exe";
#[cfg(not(windows))]
pub const ENGINE_BINARY: &str = "sd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownFolder {
    Cache,
    Config,
    Downloads,
    Home,
}

/// Looks up a platform folder. `directories` goes through the native
/// known-folder APIs on Windows and macOS and the XDG variables elsewhere.
pub fn resolve_known_folder(kind: KnownFolder) -> Option<PathBuf> {
    match kind {
        KnownFolder::Cache => project_dirs().map(|dirs| dirs.cache_dir().to_path_buf()),
        KnownFolder::Config => project_dirs().map(|dirs| dirs.config_dir().to_path_buf()),
        KnownFolder::Downloads => {
            UserDirs::new().and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        }
        KnownFolder::Home => BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf()),
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    cache_root: PathBuf,
    config_dir: PathBuf,
    output_dir: PathBuf,
}

impl AppPaths {
    /// Resolves every directory without touching the filesystem beyond
    /// existence checks. Never fails: each lookup has a fallback.
    pub fn resolve() -> Self {
        let home = resolve_known_folder(KnownFolder::Home);
        let fallback_root = home
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(format!(".{APP_NAME}"));

        let cache_root = std::env::var_os(ENV_CACHE_DIR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| resolve_known_folder(KnownFolder::Cache))
            .unwrap_or_else(|| fallback_root.join("cache"));
        let config_dir = resolve_known_folder(KnownFolder::Config)
            .unwrap_or_else(|| fallback_root.join("config"));
        let output_dir =
            output_dir_from(resolve_known_folder(KnownFolder::Downloads), home.as_deref());

        Self {
            cache_root,
            config_dir,
            output_dir,
        }
    }

    pub fn new(cache_root: PathBuf, config_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            cache_root,
            config_dir,
            output_dir,
        }
    }

    #[must_use]
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn models_dir(&self) -> PathBuf {
        self.cache_root.join("models")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.cache_root.join("bin")
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Creates every directory. Safe to call repeatedly.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.models_dir(),
            self.bin_dir(),
            self.config_dir.clone(),
            self.output_dir.clone(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("create dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Ordered engine candidates; the first existing file wins.
    pub fn engine_search_paths(&self, explicit: Option<&Path>, extra: &[PathBuf]) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = explicit {
            candidates.push(path.to_path_buf());
        }
        candidates.extend(extra.iter().map(|path| {
            if path.is_dir() {
                path.join(ENGINE_BINARY)
            } else {
                path.clone()
            }
        }));
        candidates.push(self.bin_dir().join(ENGINE_BINARY));
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            candidates.push(exe_dir.join("bin").join(ENGINE_BINARY));
            candidates.push(exe_dir.join(ENGINE_BINARY));
        }
        if let Some(path_var) = std::env::var_os("PATH") {
            candidates.extend(std::env::split_paths(&path_var).map(|dir| dir.join(ENGINE_BINARY)));
        }
        candidates
    }
}

pub fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|path| path.is_file()).cloned()
}

/// Downloads folder, then `~/Downloads`, then home, then the working directory.
pub fn output_dir_from(downloads: Option<PathBuf>, home: Option<&Path>) -> PathBuf {
    if let Some(downloads) = downloads.filter(|dir| dir.is_dir()) {
        return downloads;
    }
    match home {
        Some(home) => {
            let downloads = home.join("Downloads");
            if downloads.is_dir() {
                downloads
            } else {
                home.to_path_buf()
            }
        }
        None => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dir_prefers_existing_downloads_folder() {
        let temp = tempfile::tempdir().unwrap();
        let downloads = temp.path().join("dl");
        fs::create_dir_all(&downloads).unwrap();

        let resolved = output_dir_from(Some(downloads.clone()), Some(temp.path()));
        assert_eq!(resolved, downloads);
    }

    #[test]
    fn output_dir_falls_back_to_home_downloads_then_home() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("missing");

        assert_eq!(
            output_dir_from(Some(missing.clone()), Some(temp.path())),
            temp.path()
        );

        fs::create_dir_all(temp.path().join("Downloads")).unwrap();
        assert_eq!(
            output_dir_from(Some(missing), Some(temp.path())),
            temp.path().join("Downloads")
        );
    }

    #[test]
    fn output_dir_without_home_uses_working_directory() {
        assert_eq!(output_dir_from(None, None), PathBuf::from("."));
    }

    #[test]
    fn ensure_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(
            temp.path().join("cache"),
            temp.path().join("config"),
            temp.path().join("out"),
        );
        paths.ensure().unwrap();
        paths.ensure().unwrap();
        assert!(paths.models_dir().is_dir());
        assert!(paths.bin_dir().is_dir());
        assert!(paths.config_dir().is_dir());
        assert!(paths.output_dir().is_dir());
    }

    #[test]
    fn engine_search_starts_with_explicit_then_extra_then_cache() {
        let temp = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(
            temp.path().join("cache"),
            temp.path().join("config"),
            temp.path().join("out"),
        );
        let explicit = temp.path().join("custom-sd");
        let extra_dir = temp.path().join("tools");
        fs::create_dir_all(&extra_dir).unwrap();

        let candidates = paths.engine_search_paths(Some(&explicit), &[extra_dir.clone()]);
        assert_eq!(candidates[0], explicit);
        assert_eq!(candidates[1], extra_dir.join(ENGINE_BINARY));
        assert_eq!(candidates[2], paths.bin_dir().join(ENGINE_BINARY));
    }

    #[test]
    fn first_existing_skips_missing_candidates() {
        let temp = tempfile::tempdir().unwrap();
        let present = temp.path().join("sd");
        fs::write(&present, b"#!").unwrap();
        let found = first_existing(&[temp.path().join("nope"), present.clone()]);
        assert_eq!(found, Some(present));
        assert_eq!(first_existing(&[temp.path().join("nope")]), None);
    }
}
