//! Matches a finished download to the file it produced.
//!
//! The engine names its output after the raw title and may rename it during
//! post-processing, so the exact path cannot be predicted. Instead we look at
//! files modified within a trailing window and prefer the newest one whose
//! name contains the sanitized title, falling back to the newest file overall.
//!
//! Two downloads finishing inside the same window in a shared directory can
//! both pick the same file. Per-task output directories (see `service`) avoid
//! that at the cost of a move after resolution.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(
        "download finished but no file was written in the last {window_secs}s (expected \"{expected_title}\")"
    )]
    FileNotFoundAfterDownload {
        expected_title: String,
        window_secs: u64,
    },
    #[error("scanning {}: {source}", dir.display())]
    Scan {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file seen inside the candidate window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub filename: String,
    pub modified: SystemTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    pub filename: String,
    /// `false` when the pick came from the most-recent fallback.
    pub matched_title: bool,
}

/// Runs the full protocol against `dir` as of `now`.
pub fn resolve_downloaded_file(
    dir: &Path,
    expected_title: &str,
    window: Duration,
    now: SystemTime,
) -> Result<Resolution, ResolutionError> {
    let candidates = candidates_in_window(dir, window, now).map_err(|source| {
        ResolutionError::Scan {
            dir: dir.to_path_buf(),
            source,
        }
    })?;
    debug!(
        dir = %dir.display(),
        expected_title,
        candidates = candidates.len(),
        "resolving download"
    );

    let resolution = select_candidate(candidates, expected_title).ok_or_else(|| {
        ResolutionError::FileNotFoundAfterDownload {
            expected_title: expected_title.to_string(),
            window_secs: window.as_secs(),
        }
    })?;
    if !resolution.matched_title {
        warn!(
            expected_title,
            filename = %resolution.filename,
            "no filename matched the title; using the most recent file"
        );
    }
    Ok(resolution)
}

/// Regular, finished files in `dir` modified no more than `window` before
/// `now`. Files stamped in the future count as fresh. A missing directory is
/// an empty window.
pub fn candidates_in_window(
    dir: &Path,
    window: Duration,
    now: SystemTime,
) -> io::Result<Vec<Candidate>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();
        if is_partial_artifact(&filename) {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let fresh = match now.duration_since(modified) {
            Ok(age) => age <= window,
            Err(_) => true,
        };
        if fresh {
            candidates.push(Candidate {
                path: entry.path(),
                filename,
                modified,
            });
        }
    }
    Ok(candidates)
}

/// Pure selection step: newest title match, else newest overall. Equal
/// timestamps fall back to the larger filename so the pick is stable.
pub fn select_candidate(candidates: Vec<Candidate>, expected_title: &str) -> Option<Resolution> {
    let needle = expected_title.trim().to_lowercase();
    let newest = |pool: Vec<Candidate>| {
        pool.into_iter()
            .max_by(|a, b| (a.modified, &a.filename).cmp(&(b.modified, &b.filename)))
    };

    let (matching, others): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| !needle.is_empty() && c.filename.to_lowercase().contains(&needle));

    if let Some(found) = newest(matching) {
        return Some(Resolution {
            path: found.path,
            filename: found.filename,
            matched_title: true,
        });
    }
    newest(others).map(|found| Resolution {
        path: found.path,
        filename: found.filename,
        matched_title: false,
    })
}

/// Engine scratch files that must never be mistaken for a finished track.
pub fn is_partial_artifact(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    lower.ends_with(".part")
        || lower.ends_with(".ytdl")
        || lower.ends_with(".temp")
        || lower.contains(".part-frag")
        || lower.starts_with('.')
}
