use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info};

use super::{
    catalog::{AssetCatalog, AssetDescriptor, CatalogError},
    download::partial_path,
};

#[derive(Debug, Error)]
pub enum UninstallError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Deletes one installed asset: the file itself, or the whole extraction
/// directory for archives, plus any `.partial` left by an interrupted
/// download. Returns the removed path, or `None` when nothing was there.
pub fn uninstall(
    catalog: &AssetCatalog,
    root: &Path,
    key: &str,
) -> Result<Option<PathBuf>, UninstallError> {
    let asset = catalog.get(key)?;
    remove_if_present(&partial_path(&asset.download_path(root)))?;

    let target = removal_target(asset, root);
    let removed = remove_if_present(&target)?;
    if removed {
        info!(key, path = %target.display(), "asset removed");
    } else {
        debug!(key, path = %target.display(), "nothing to remove");
    }
    Ok(removed.then_some(target))
}

/// Archives own their extraction directory unless it is the cache root
/// itself (or not a plain relative path), in which case only the verified
/// file goes.
fn removal_target(asset: &AssetDescriptor, root: &Path) -> PathBuf {
    match &asset.archive {
        Some(archive)
            if archive.extract_dir.components().next().is_some()
                && archive
                    .extract_dir
                    .components()
                    .all(|part| matches!(part, Component::Normal(_))) =>
        {
            root.join(&archive.extract_dir)
        }
        _ => asset.path(root),
    }
}

fn remove_if_present(path: &Path) -> Result<bool, UninstallError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(UninstallError::Io {
                action: "inspect",
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|source| UninstallError::Io {
        action: "remove",
        path: path.to_path_buf(),
        source,
    })?;
    Ok(true)
}
