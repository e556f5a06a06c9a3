//! The shared downloads directory: listing, lookup, deletion and the
//! per-task scratch directories used when output isolation is on.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::security::validate_filename;

/// Extensions shown in listings and accepted by the playback route.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "webm", "wav"];

const SCRATCH_DIR: &str = ".tasks";

/// A file as the client sees it. Derived from the directory on every call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DownloadedFile {
    pub filename: String,
    pub title: String,
    pub size: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub modified: DateTime<Utc>,
    pub path: String,
}

#[derive(Clone, Debug)]
pub struct DownloadsDir {
    root: PathBuf,
}

impl DownloadsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    /// Audio files, newest first.
    pub fn list(&self) -> io::Result<Vec<DownloadedFile>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !is_audio(&path) {
                continue;
            }
            match self.record(&path) {
                Ok(record) => files.push(record),
                Err(err) => debug!(path = %path.display(), %err, "skipping unreadable file"),
            }
        }
        files.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(files)
    }

    /// Builds the client record for a file on disk.
    pub fn record(&self, path: &Path) -> io::Result<DownloadedFile> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.clone());
        Ok(DownloadedFile {
            filename,
            title,
            size: meta.len(),
            modified: DateTime::<Utc>::from(modified),
            path: path.to_string_lossy().into_owned(),
        })
    }

    /// Validates `name` and returns the path of an existing file.
    pub fn locate(&self, name: &str) -> Result<PathBuf, ServiceError> {
        validate_filename(name)?;
        let path = self.root.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ServiceError::FileMissing(name.to_string()))
        }
    }

    pub fn delete(&self, name: &str) -> Result<(), ServiceError> {
        let path = self.locate(name)?;
        fs::remove_file(&path)?;
        info!(filename = name, "deleted download");
        Ok(())
    }

    /// Private output directory for one task.
    pub fn scratch_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(SCRATCH_DIR).join(task_id)
    }

    /// Moves a resolved file from a scratch directory into the shared one,
    /// replacing any file of the same name.
    pub fn adopt(&self, resolved: &Path) -> io::Result<PathBuf> {
        let name = resolved
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "resolved path has no name"))?;
        let target = self.root.join(name);
        if let Err(err) = fs::rename(resolved, &target) {
            // Cross-device scratch dirs cannot be renamed into place.
            debug!(%err, "rename failed, copying instead");
            fs::copy(resolved, &target)?;
            fs::remove_file(resolved)?;
        }
        Ok(target)
    }

    pub fn discard_scratch(&self, task_id: &str) {
        let dir = self.scratch_dir(task_id);
        if let Err(err) = fs::remove_dir_all(&dir)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(dir = %dir.display(), %err, "could not remove scratch directory");
        }
    }
}

pub fn is_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
