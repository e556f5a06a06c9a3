//! Boundary to the external extraction engine (yt-dlp) and its transcoder
//! (ffmpeg).
//!
//! Every call here blocks until the child process exits, so callers run them
//! through `spawn_blocking`. Nothing in this module knows about tasks: the
//! download call only promises that, on success, a new audio file landed in
//! the requested directory.

use std::{
    env,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DownloadError, ExtractionError, FailureReason};

/// Output codec for every download.
pub const AUDIO_CODEC: &str = "mp3";

/// Output template handed to yt-dlp; the title is the raw, unsanitized one.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

const FORMAT_SELECTOR: &str = "bestaudio[ext=m4a]/bestaudio/best";

const FFMPEG_CANDIDATES: &[&str] = &[
    "/usr/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
    "C:\\ffmpeg\\bin\\ffmpeg.exe",
];

/// Requested audio quality. Advisory: it only picks the MP3 bitrate handed to
/// the transcoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    Medium,
    High,
    #[default]
    Best,
}

impl Quality {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "mid" => Some(Self::Medium),
            "high" => Some(Self::High),
            "best" | "" => Some(Self::Best),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Best => "best",
        }
    }

    pub fn bitrate_kbps(self) -> u32 {
        match self {
            Self::Low => 128,
            Self::Medium => 192,
            Self::High => 256,
            Self::Best => 320,
        }
    }
}

/// Tunables for a single fetch-and-transcode run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineOptions {
    pub bitrate_kbps: u32,
    /// Per-request retries; yt-dlp retries transient HTTP failures itself.
    pub retries: u32,
    pub fragment_retries: u32,
    pub socket_timeout: Duration,
    pub concurrent_fragments: u32,
    /// Directory or binary path passed as `--ffmpeg-location`.
    pub ffmpeg_location: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bitrate_kbps: Quality::Best.bitrate_kbps(),
            retries: 5,
            fragment_retries: 5,
            socket_timeout: Duration::from_secs(30),
            concurrent_fragments: 1,
            ffmpeg_location: None,
        }
    }
}

impl EngineOptions {
    pub fn for_quality(&self, quality: Quality) -> Self {
        Self {
            bitrate_kbps: quality.bitrate_kbps(),
            ..self.clone()
        }
    }
}

/// What a metadata lookup returns. `title` is never empty.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub title: String,
    pub uploader: Option<String>,
    pub duration_seconds: Option<u64>,
    pub thumbnail: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Thumbnail {
    pub url: Option<String>,
}

/// A raw search hit. Flat search results are sparse, so every field is
/// optional and defaults are applied by the caller.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SearchEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
    pub view_count: Option<u64>,
}

/// The three calls the service needs from the extraction engine.
pub trait MediaEngine: Send + Sync {
    /// Text search; returns at most `limit` entries.
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchEntry>, ExtractionError>;

    /// Looks up metadata without writing anything to disk.
    fn extract_metadata(&self, url: &str) -> Result<Metadata, ExtractionError>;

    /// Downloads `url` and transcodes it into `output_dir`. The produced file
    /// is not reported back; see `resolve`.
    fn fetch_and_transcode(
        &self,
        url: &str,
        output_dir: &Path,
        options: &EngineOptions,
        progress: &dyn Fn(f32),
    ) -> Result<(), DownloadError>;
}

#[derive(Deserialize)]
struct RawInfo {
    title: Option<String>,
    fulltitle: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
}

#[derive(Deserialize)]
struct RawSearch {
    #[serde(default)]
    entries: Vec<Option<SearchEntry>>,
}

/// `MediaEngine` backed by the yt-dlp executable.
#[derive(Clone, Debug)]
pub struct YtDlpEngine {
    program: PathBuf,
    lookup_timeout: Duration,
}

impl YtDlpEngine {
    pub fn new(program: impl Into<PathBuf>, lookup_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            lookup_timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs `yt-dlp --version` so a missing engine is reported at startup
    /// rather than on the first download.
    pub fn check_available(&self) -> Result<String, DownloadError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|err| launch_error(&self.program, err))?;
        if !output.status.success() {
            return Err(DownloadError::new(
                FailureReason::Engine,
                format!("{} --version exited with {}", self.program.display(), output.status),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn lookup_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--ignore-config")
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--socket-timeout")
            .arg(self.lookup_timeout.as_secs().max(1).to_string())
            .stdin(Stdio::null());
        command
    }

    fn run_lookup(&self, mut command: Command, lookup: &str) -> Result<Vec<u8>, ExtractionError> {
        debug!(lookup, "engine lookup");
        let output = command.output().map_err(|err| {
            let failure = launch_error(&self.program, err);
            ExtractionError::Engine {
                reason: failure.reason,
                message: failure.message,
            }
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::Engine {
                reason: classify_failure(&stderr),
                message: failure_message(&stderr, &output.status.to_string()),
            });
        }
        Ok(output.stdout)
    }
}

impl MediaEngine for YtDlpEngine {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchEntry>, ExtractionError> {
        let target = format!("ytsearch{}:{}", limit.max(1), query);
        let mut command = self.lookup_command();
        command.arg("--flat-playlist").arg(&target);
        let stdout = self.run_lookup(command, &target)?;
        let parsed: RawSearch = serde_json::from_slice(&stdout)
            .map_err(|err| ExtractionError::Malformed(err.to_string()))?;
        Ok(parsed.entries.into_iter().flatten().take(limit).collect())
    }

    fn extract_metadata(&self, url: &str) -> Result<Metadata, ExtractionError> {
        let mut command = self.lookup_command();
        command.arg("--no-playlist").arg(url);
        let stdout = self.run_lookup(command, url)?;
        let info: RawInfo = serde_json::from_slice(&stdout)
            .map_err(|err| ExtractionError::Malformed(err.to_string()))?;
        metadata_from_info(url, info)
    }

    fn fetch_and_transcode(
        &self,
        url: &str,
        output_dir: &Path,
        options: &EngineOptions,
        progress: &dyn Fn(f32),
    ) -> Result<(), DownloadError> {
        let args = download_args(url, output_dir, options);
        info!(url, dir = %output_dir.display(), bitrate = options.bitrate_kbps, "engine download");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| launch_error(&self.program, err))?;

        // Drain stderr on its own thread so a chatty engine cannot block on a
        // full pipe while stdout is being read.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer);
                buffer
            })
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if let Some(percent) = parse_progress_line(&line) {
                    progress(percent);
                }
            }
        }

        let status = child.wait().map_err(|err| {
            DownloadError::new(FailureReason::Engine, format!("waiting for engine: {err}"))
        })?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        let reason = classify_failure(&stderr);
        let message = failure_message(&stderr, &status.to_string());
        warn!(url, %reason, %message, "engine download failed");
        Err(DownloadError::new(reason, message))
    }
}

fn metadata_from_info(url: &str, info: RawInfo) -> Result<Metadata, ExtractionError> {
    let title = info
        .title
        .or(info.fulltitle)
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .ok_or_else(|| ExtractionError::MissingTitle {
            url: url.to_string(),
        })?;
    Ok(Metadata {
        title,
        uploader: info
            .uploader
            .or(info.channel)
            .filter(|value| !value.trim().is_empty()),
        duration_seconds: info
            .duration
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value.round() as u64),
        thumbnail: info.thumbnail.filter(|value| !value.is_empty()),
    })
}

fn download_args(url: &str, output_dir: &Path, options: &EngineOptions) -> Vec<String> {
    // Resolution looks for a fresh mtime, so neither a user config nor the
    // upload date may set it.
    let mut args = vec![
        "--ignore-config".to_string(),
        "--no-mtime".to_string(),
        "--format".to_string(),
        FORMAT_SELECTOR.to_string(),
        "--extract-audio".to_string(),
        "--audio-format".to_string(),
        AUDIO_CODEC.to_string(),
        "--audio-quality".to_string(),
        format!("{}K", options.bitrate_kbps),
        "--output".to_string(),
        output_dir.join(OUTPUT_TEMPLATE).to_string_lossy().into_owned(),
        "--no-playlist".to_string(),
        "--force-overwrites".to_string(),
        "--newline".to_string(),
        "--no-warnings".to_string(),
        "--retries".to_string(),
        options.retries.to_string(),
        "--fragment-retries".to_string(),
        options.fragment_retries.to_string(),
        "--socket-timeout".to_string(),
        options.socket_timeout.as_secs().max(1).to_string(),
        "--concurrent-fragments".to_string(),
        options.concurrent_fragments.max(1).to_string(),
    ];
    if let Some(location) = &options.ffmpeg_location {
        args.push("--ffmpeg-location".to_string());
        args.push(location.to_string_lossy().into_owned());
    }
    args.push(url.to_string());
    args
}

/// Extracts the percentage from a `[download]  42.3% of ...` progress line.
pub fn parse_progress_line(line: &str) -> Option<f32> {
    let rest = line.trim_start().strip_prefix("[download]")?;
    let (number, _) = rest.trim_start().split_once('%')?;
    number.trim().parse::<f32>().ok()
}

/// Maps engine stderr onto a failure reason. Restrictions and missing videos
/// are final; network trouble is the only transient class.
pub fn classify_failure(stderr: &str) -> FailureReason {
    let lower = stderr.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if any(&[
        "sign in to confirm your age",
        "age-restricted",
        "age restricted",
        "not available in your country",
        "geo restrict",
        "geo-restrict",
        "private video",
        "members-only",
        "join this channel",
    ]) {
        FailureReason::Restricted
    } else if any(&[
        "video unavailable",
        "has been removed",
        "does not exist",
        "http error 404",
        "unsupported url",
        "is not a valid url",
    ]) {
        FailureReason::Unavailable
    } else if any(&["postprocessing", "ffmpeg", "ffprobe"]) {
        FailureReason::Transcode
    } else if any(&[
        "timed out",
        "connection",
        "network is unreachable",
        "temporary failure in name resolution",
        "http error 5",
        "unable to download",
    ]) {
        FailureReason::Network
    } else {
        FailureReason::Engine
    }
}

/// Picks the most useful line of engine stderr for the task's error field.
fn failure_message(stderr: &str, status: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| format!("engine exited with {status}"))
}

fn launch_error(program: &Path, err: std::io::Error) -> DownloadError {
    DownloadError::new(
        FailureReason::Engine,
        format!("launching {}: {err}", program.display()),
    )
}

/// Finds an ffmpeg binary: the explicit hint, then well-known install
/// locations, then `PATH`.
pub fn locate_ffmpeg(hint: Option<&Path>) -> Option<PathBuf> {
    if let Some(hint) = hint {
        if hint.exists() {
            return Some(hint.to_path_buf());
        }
        warn!(hint = %hint.display(), "configured ffmpeg location does not exist");
    }
    if let Some(found) = FFMPEG_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.is_file())
    {
        return Some(found);
    }
    let path_var = env::var_os("PATH")?;
    let binary = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };
    env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
