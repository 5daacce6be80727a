use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use tar::Archive;
use thiserror::Error;
use tracing::debug;
use zip::read::ZipArchive;

use super::catalog::ArchiveFormat;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 32 * 1024;
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download of {url} failed: {reason}")]
    Transfer { url: String, reason: String },
    #[error("download of {url} cancelled")]
    Cancelled { url: String },
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    fn transfer(url: &str, reason: impl ToString) -> Self {
        DownloadError::Transfer {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        DownloadError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Error)]
#[error("extracting {} failed: {reason}", .archive.display())]
pub struct ExtractionError {
    pub archive: PathBuf,
    pub reason: String,
}

/// Moves one URL onto one local path. Implementations must never leave a
/// partial file at `destination`.
pub trait Fetcher {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, DownloadError>;
}

/// Blocking HTTP fetcher. Bytes go to `<destination>.partial` first and are
/// renamed into place only after the body has been read completely.
pub struct HttpDownloader {
    client: Client,
    cancel: Arc<AtomicBool>,
}

impl HttpDownloader {
    pub fn new(cancel: Arc<AtomicBool>) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Option::<Duration>::None)
            .user_agent(concat!("zimage-gen/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| DownloadError::transfer("<client>", error))?;
        Ok(Self::with_client(client, cancel))
    }

    pub fn with_client(client: Client, cancel: Arc<AtomicBool>) -> Self {
        Self { client, cancel }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

impl Fetcher for HttpDownloader {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, DownloadError> {
        if self.is_cancelled() {
            return Err(DownloadError::Cancelled { url: url.into() });
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| DownloadError::io("create directory", parent, error))?;
        }

        debug!(url, destination = %destination.display(), "requesting");
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|error| DownloadError::transfer(url, error))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::transfer(url, format!("HTTP {status}")));
        }
        let total = response.content_length().unwrap_or(0);

        let partial = PartialFile::new(partial_path(destination));
        let mut file = File::create(partial.path())
            .map_err(|error| DownloadError::io("create partial file", partial.path(), error))?;
        let mut downloaded = 0u64;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            if self.is_cancelled() {
                return Err(DownloadError::Cancelled { url: url.into() });
            }
            let read = response
                .read(&mut buffer)
                .map_err(|error| DownloadError::transfer(url, error))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|error| DownloadError::io("write chunk to", partial.path(), error))?;
            downloaded += read as u64;
            progress(downloaded, total);
        }

        if total > 0 && downloaded != total {
            return Err(DownloadError::transfer(
                url,
                format!("body ended after {downloaded} of {total} bytes"),
            ));
        }
        file.sync_all()
            .map_err(|error| DownloadError::io("sync", partial.path(), error))?;
        drop(file);

        partial.commit(destination)?;
        debug!(url, bytes = downloaded, "download complete");
        Ok(downloaded)
    }
}

/// Removes its file on drop unless committed.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(mut self, destination: &Path) -> Result<(), DownloadError> {
        fs::rename(&self.path, destination)
            .map_err(|error| DownloadError::io("move download into", destination, error))?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[must_use]
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Unpacks `archive` into `destination`, dropping the first `strip`
/// components of every entry path.
pub fn extract_archive(
    format: ArchiveFormat,
    archive: &Path,
    destination: &Path,
    strip: u8,
) -> Result<(), ExtractionError> {
    extract_inner(format, archive, destination, strip).map_err(|error| ExtractionError {
        archive: archive.to_path_buf(),
        reason: format!("{error:#}"),
    })
}

fn extract_inner(
    format: ArchiveFormat,
    archive: &Path,
    destination: &Path,
    strip: u8,
) -> anyhow::Result<()> {
    fs::create_dir_all(destination).context("create destination directory")?;
    let file = File::open(archive).context("open archive")?;
    match format {
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(file), destination, strip),
        ArchiveFormat::TarBz2 => extract_tar(BzDecoder::new(file), destination, strip),
        ArchiveFormat::Zip => extract_zip(file, destination, strip),
    }
}

fn extract_tar<R: Read>(reader: R, destination: &Path, strip: u8) -> anyhow::Result<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries().context("iterate tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        let path = entry.path().context("read entry path")?.into_owned();
        let Some(dest) = entry_destination(destination, &path, strip)? else {
            continue;
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("create entry parent")?;
        }
        let kind = entry.header().entry_type();
        if kind.is_hard_link() {
            // Hard link targets name another archive member, not a path on disk.
            let target = link_target(&entry)?;
            let Some(source) = entry_destination(destination, &target, strip)? else {
                return Err(anyhow!("hard link {:?} points at a stripped entry", path));
            };
            fs::hard_link(&source, &dest).context("create hard link")?;
            continue;
        }
        if kind.is_symlink() {
            let target = link_target(&entry)?;
            if target
                .components()
                .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir))
            {
                return Err(anyhow!("symlink {:?} -> {:?} escapes the destination", path, target));
            }
        }
        entry.unpack(&dest).context("unpack tar entry")?;
    }
    Ok(())
}

fn link_target<R: Read>(entry: &tar::Entry<'_, R>) -> anyhow::Result<PathBuf> {
    entry
        .link_name()
        .context("read link target")?
        .map(|target| target.into_owned())
        .ok_or_else(|| anyhow!("link entry without a target"))
}

fn extract_zip(file: File, destination: &Path, strip: u8) -> anyhow::Result<()> {
    let mut archive = ZipArchive::new(file).context("open zip archive")?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("read zip entry")?;
        let path = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("zip entry {:?} escapes the archive", entry.name()))?;
        let Some(dest) = entry_destination(destination, &path, strip)? else {
            continue;
        };
        if entry.is_dir() {
            fs::create_dir_all(&dest).context("create zip dir")?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("create zip file parent")?;
        }
        let mut outfile = File::create(&dest).context("create zip file")?;
        io::copy(&mut entry, &mut outfile).context("write zip file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777))
                    .context("set zip file permissions")?;
            }
        }
    }
    Ok(())
}

/// `None` for entries consumed entirely by stripping (e.g. the top folder).
fn entry_destination(root: &Path, path: &Path, strip: u8) -> anyhow::Result<Option<PathBuf>> {
    if path
        .components()
        .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir))
    {
        return Err(anyhow!("entry {:?} escapes the destination", path));
    }
    let relative: PathBuf = path
        .components()
        .filter(|part| matches!(part, Component::Normal(_)))
        .skip(strip as usize)
        .collect();
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(root.join(relative)))
}

pub(crate) fn filename_from_uri(uri: &str) -> Option<String> {
    let without_fragment = uri.split('#').next()?;
    let without_query = without_fragment.split('?').next()?;
    let clean = without_query.rsplit('/').next()?.trim();
    if clean.is_empty() || clean.contains(':') {
        None
    } else {
        Some(clean.to_string())
    }
}
