//! Orchestrates search and the download task flow on top of the engine, the
//! task registry and the downloads directory.
//!
//! A download runs as one spawned unit of work:
//! `pending → extracting → downloading → completed | failed`. Every engine
//! call runs on the blocking pool while holding a permit. Downloads draw from
//! a pool of `max_concurrent_downloads` permits; searches draw from a separate
//! pool of `max_concurrent_lookups`, so busy downloads never queue a search.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::RuntimeSettings,
    engine::{EngineOptions, MediaEngine, Quality, SearchEntry},
    error::{ExtractionError, ServiceError},
    files::{DownloadedFile, DownloadsDir},
    resolve::resolve_downloaded_file,
    sanitize::{placeholder_title, sanitize, usable_title},
    tasks::{DownloadTask, TaskId, TaskStore, Transition},
};

pub const MIN_QUERY_CHARS: usize = 2;
pub const UNKNOWN_ARTIST: &str = "Unknown artist";
pub const UNKNOWN_TITLE: &str = "Unknown title";

const SEARCH_SUFFIXES: &[&str] = &["música", "audio", "song"];

/// One search hit with every field filled in.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub duration: u64,
    pub thumbnail: String,
    pub url: String,
    pub view_count: u64,
}

impl From<SearchEntry> for SearchResult {
    fn from(entry: SearchEntry) -> Self {
        let id = entry
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let title = entry
            .title
            .as_deref()
            .and_then(usable_title)
            .unwrap_or_else(|| UNKNOWN_TITLE.to_string());
        let artist = entry
            .uploader
            .or(entry.channel)
            .filter(|artist| !artist.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
        let thumbnail = entry
            .thumbnail
            .or_else(|| entry.thumbnails.into_iter().rev().find_map(|thumb| thumb.url))
            .unwrap_or_default();
        let url = entry
            .webpage_url
            .or(entry.url)
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={id}"));
        Self {
            title,
            artist,
            duration: entry
                .duration
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| secs.round() as u64)
                .unwrap_or(0),
            thumbnail,
            url,
            view_count: entry.view_count.unwrap_or(0),
            id,
        }
    }
}

/// A finished task together with the file it produced.
#[derive(Clone, Debug)]
pub struct CompletedDownload {
    pub task: DownloadTask,
    pub file: DownloadedFile,
}

/// Snapshot reported by the health endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct SystemInfo {
    pub downloads_directory: String,
    pub downloads_ok: bool,
    pub ffmpeg_available: bool,
    pub ffmpeg_path: Option<String>,
    pub total_files: usize,
}

#[derive(Clone)]
pub struct DownloadService {
    engine: Arc<dyn MediaEngine>,
    store: Arc<dyn TaskStore>,
    downloads: DownloadsDir,
    settings: Arc<RuntimeSettings>,
    workers: Arc<Semaphore>,
    lookups: Arc<Semaphore>,
}

impl DownloadService {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        store: Arc<dyn TaskStore>,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        Self {
            engine,
            store,
            downloads: DownloadsDir::new(settings.downloads_dir.clone()),
            workers: Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1))),
            lookups: Arc::new(Semaphore::new(settings.max_concurrent_lookups.max(1))),
            settings,
        }
    }

    pub fn downloads(&self) -> &DownloadsDir {
        &self.downloads
    }

    /// Runs the search fallback chain and returns the first non-empty batch.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ServiceError> {
        let query = query.trim();
        if query.chars().count() < MIN_QUERY_CHARS {
            return Err(ServiceError::validation(format!(
                "query must be at least {MIN_QUERY_CHARS} characters"
            )));
        }

        let limit = self.settings.search_limit;
        let mut last_error: Option<ExtractionError> = None;
        let mut any_answered = false;
        for attempt in search_attempts(query) {
            info!(query = %attempt, "searching");
            let engine = self.engine.clone();
            let lookup = attempt.clone();
            let outcome = self
                .run_lookup(move || Ok(engine.search(&lookup, limit)))
                .await?;
            match outcome {
                Ok(entries) if !entries.is_empty() => {
                    info!(query = %attempt, found = entries.len(), "search hit");
                    return Ok(entries.into_iter().map(SearchResult::from).collect());
                }
                Ok(_) => any_answered = true,
                Err(err) => {
                    warn!(query = %attempt, %err, "search attempt failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) if !any_answered => Err(err.into()),
            _ => Ok(Vec::new()),
        }
    }

    /// Checks that `raw` is an http(s) URL on an allowed host.
    pub fn validate_url(&self, raw: &str) -> Result<Url, ServiceError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ServiceError::validation("url is required"));
        }
        let url = Url::parse(raw).map_err(|err| ServiceError::validation(format!("invalid url: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServiceError::validation("only http and https urls are accepted"));
        }
        let host = url
            .host_str()
            .map(|host| host.trim_end_matches('.').to_ascii_lowercase())
            .ok_or_else(|| ServiceError::validation("url has no host"))?;
        let allowed = self
            .settings
            .allowed_hosts
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")));
        if !allowed {
            return Err(ServiceError::validation(format!(
                "downloads from {host} are not allowed"
            )));
        }
        Ok(url)
    }

    /// Validates the request, registers a task and starts it. The returned
    /// handle resolves when the task reaches a terminal state.
    pub fn start_download(
        &self,
        raw_url: &str,
        quality: Option<&str>,
    ) -> Result<(TaskId, JoinHandle<Result<CompletedDownload, ServiceError>>), ServiceError> {
        let url = self.validate_url(raw_url)?;
        let quality = match quality {
            Some(value) => Quality::parse(value).ok_or_else(|| {
                ServiceError::validation(format!(
                    "unknown quality \"{value}\" (expected low, medium, high or best)"
                ))
            })?,
            None => Quality::default(),
        };

        let task_id = self.store.create(url.as_str(), quality);
        info!(task_id = %task_id, url = %url, quality = quality.as_str(), "download accepted");
        let service = self.clone();
        let id = task_id.clone();
        let handle = tokio::spawn(async move { service.run_task(id, url.to_string(), quality).await });
        Ok((task_id, handle))
    }

    pub fn task(&self, task_id: &str) -> Result<DownloadTask, ServiceError> {
        Ok(self.store.get(task_id)?)
    }

    /// Listing for the client; degrades to empty when the directory is
    /// unreadable.
    pub async fn list_downloads(&self) -> Vec<DownloadedFile> {
        let downloads = self.downloads.clone();
        match tokio::task::spawn_blocking(move || downloads.list()).await {
            Ok(Ok(files)) => files,
            Ok(Err(err)) => {
                warn!(%err, dir = %self.downloads.root().display(), "listing downloads failed");
                Vec::new()
            }
            Err(err) => {
                warn!(%err, "listing task panicked");
                Vec::new()
            }
        }
    }

    pub async fn delete_download(&self, filename: &str) -> Result<(), ServiceError> {
        let downloads = self.downloads.clone();
        let name = filename.to_string();
        tokio::task::spawn_blocking(move || downloads.delete(&name))
            .await
            .map_err(|err| ServiceError::Worker(err.to_string()))?
    }

    pub fn system_info(&self, total_files: usize) -> SystemInfo {
        let ffmpeg = self.settings.engine.ffmpeg_location.as_ref();
        SystemInfo {
            downloads_directory: self.downloads.root().to_string_lossy().into_owned(),
            downloads_ok: self.downloads.is_available(),
            ffmpeg_available: ffmpeg.is_some(),
            ffmpeg_path: ffmpeg.map(|path| path.to_string_lossy().into_owned()),
            total_files,
        }
    }

    async fn run_task(
        self,
        task_id: TaskId,
        url: String,
        quality: Quality,
    ) -> Result<CompletedDownload, ServiceError> {
        let result = self.execute(&task_id, &url, quality).await;
        if self.settings.isolate_task_output {
            self.downloads.discard_scratch(&task_id);
        }
        if let Err(err) = &result {
            error!(task_id = %task_id, url = %url, %err, "download failed");
            if let Err(transition_err) = self.store.transition(
                &task_id,
                Transition::Failed {
                    error: err.to_string(),
                },
            ) {
                warn!(task_id = %task_id, %transition_err, "could not record failure");
            }
        }
        result
    }

    async fn execute(
        &self,
        task_id: &str,
        url: &str,
        quality: Quality,
    ) -> Result<CompletedDownload, ServiceError> {
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| ServiceError::Worker(err.to_string()))?;

        self.store.transition(task_id, Transition::Extracting)?;
        let engine = self.engine.clone();
        let lookup_url = url.to_string();
        let metadata = blocking(move || Ok(engine.extract_metadata(&lookup_url)?)).await?;

        let expected_title = sanitize(&metadata.title);
        let display_title = if expected_title.is_empty() {
            placeholder_title(task_id)
        } else {
            expected_title.clone()
        };
        self.store.transition(
            task_id,
            Transition::Downloading {
                title: display_title,
                artist: metadata
                    .uploader
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
                duration_seconds: metadata.duration_seconds.unwrap_or(0),
                thumbnail: metadata.thumbnail.clone(),
            },
        )?;

        let output_dir = if self.settings.isolate_task_output {
            self.downloads.scratch_dir(task_id)
        } else {
            self.downloads.root().to_path_buf()
        };
        let fetch = FetchJob {
            engine: self.engine.clone(),
            store: self.store.clone(),
            task_id: task_id.to_string(),
            url: url.to_string(),
            output_dir,
            options: self.settings.engine.for_quality(quality),
            expected_title,
            window: self.settings.resolution_window,
        };
        let resolved = blocking(move || fetch.run()).await?;

        let final_path = if self.settings.isolate_task_output {
            let downloads = self.downloads.clone();
            blocking(move || Ok(downloads.adopt(&resolved)?)).await?
        } else {
            resolved
        };
        let downloads = self.downloads.clone();
        let record_path = final_path.clone();
        let file = blocking(move || Ok(downloads.record(&record_path)?)).await?;

        let task = self
            .store
            .transition(task_id, Transition::Completed { path: final_path })?;
        info!(task_id, filename = %file.filename, size = file.size, "download completed");
        Ok(CompletedDownload { task, file })
    }

    async fn run_lookup<T, F>(&self, job: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .lookups
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| ServiceError::Worker(err.to_string()))?;
        blocking(job).await
    }
}

/// Everything the blocking half of a download needs, owned so it can move
/// onto the blocking pool.
struct FetchJob {
    engine: Arc<dyn MediaEngine>,
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
    url: String,
    output_dir: PathBuf,
    options: EngineOptions,
    expected_title: String,
    window: Duration,
}

impl FetchJob {
    fn run(self) -> Result<PathBuf, ServiceError> {
        std::fs::create_dir_all(&self.output_dir)?;
        let store = self.store.clone();
        let task_id = self.task_id.clone();
        let progress = move |percent: f32| {
            let _ = store.record_progress(&task_id, percent);
        };
        self.engine
            .fetch_and_transcode(&self.url, &self.output_dir, &self.options, &progress)?;
        let resolution = resolve_downloaded_file(
            &self.output_dir,
            &self.expected_title,
            self.window,
            SystemTime::now(),
        )?;
        Ok(resolution.path)
    }
}

async fn blocking<T, F>(job: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| ServiceError::Worker(err.to_string()))?
}

/// Queries tried in order until one returns entries.
pub fn search_attempts(query: &str) -> Vec<String> {
    let query = query.trim();
    let mut attempts = vec![query.to_string()];
    attempts.extend(SEARCH_SUFFIXES.iter().map(|suffix| format!("{query} {suffix}")));
    let words: Vec<&str> = query.split_whitespace().collect();
    if words.len() > 1 {
        for word in words.into_iter().filter(|word| word.chars().count() > 2) {
            let broad = format!("{word} música");
            if !attempts.contains(&broad) {
                attempts.push(broad);
            }
        }
    }
    attempts
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeEngine, song_engine};
    use super::*;
    use crate::{
        engine::Thumbnail,
        error::FailureReason,
        resolve::ResolutionError,
        tasks::{InMemoryTaskStore, TaskStatus, testing::FixedClock},
    };
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn entry(id: &str, title: &str) -> SearchEntry {
        SearchEntry {
            id: Some(id.into()),
            title: Some(title.into()),
            ..SearchEntry::default()
        }
    }

    fn service_with(engine: FakeEngine, tweak: impl FnOnce(&mut RuntimeSettings)) -> (TempDir, DownloadService) {
        let dir = tempdir().unwrap();
        let mut settings = RuntimeSettings {
            downloads_dir: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        };
        tweak(&mut settings);
        let store = Arc::new(InMemoryTaskStore::new(Arc::new(FixedClock::new())));
        let service = DownloadService::new(Arc::new(engine), store, Arc::new(settings));
        (dir, service)
    }

    #[tokio::test]
    async fn search_returns_every_stubbed_entry() {
        let engine = FakeEngine::default();
        engine.search_answers.lock().push((
            "bad bunny".into(),
            Ok(vec![
                entry("a", "Bad Bunny - Tití Me Preguntó"),
                entry("b", "Bad Bunny - Me Porto Bonito"),
                entry("c", "Bad Bunny - Ojitos Lindos"),
            ]),
        ));
        let (_dir, service) = service_with(engine, |_| {});
        let results = service.search("bad bunny").await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].artist, UNKNOWN_ARTIST);
        assert_eq!(results[0].view_count, 0);
        assert_eq!(results[2].url, "https://www.youtube.com/watch?v=c");
    }

    #[tokio::test]
    async fn short_queries_are_rejected() {
        let (_dir, service) = service_with(FakeEngine::default(), |_| {});
        for query in ["a", "  b  ", ""] {
            assert!(matches!(
                service.search(query).await,
                Err(ServiceError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn search_falls_back_through_the_chain() {
        let engine = FakeEngine::default();
        engine
            .search_answers
            .lock()
            .push(("bunny música".into(), Ok(vec![entry("x", "Found")])));
        let (_dir, service) = service_with(engine, |_| {});
        let results = service.search("bad bunny").await.unwrap();
        assert_eq!(results[0].title, "Found");
    }

    #[tokio::test]
    async fn search_surfaces_the_last_error_when_every_attempt_fails() {
        let engine = FakeEngine::default();
        for query in search_attempts("xy") {
            engine
                .search_answers
                .lock()
                .push((query.clone(), Err(format!("failed {query}"))));
        }
        let (_dir, service) = service_with(engine, |_| {});
        let err = service.search("xy").await.unwrap_err();
        assert!(err.to_string().contains("failed xy song"));
    }

    #[tokio::test]
    async fn search_with_no_hits_is_empty_not_an_error() {
        let (_dir, service) = service_with(FakeEngine::default(), |_| {});
        assert!(service.search("nothing here").await.unwrap().is_empty());
    }

    #[test]
    fn attempts_follow_the_fallback_order() {
        assert_eq!(
            search_attempts(" bad bunny "),
            vec![
                "bad bunny",
                "bad bunny música",
                "bad bunny audio",
                "bad bunny song",
                "bad música",
                "bunny música",
            ]
        );
        assert_eq!(search_attempts("ab").len(), 4);
    }

    #[test]
    fn search_result_defaults_missing_fields() {
        let result = SearchResult::from(SearchEntry {
            title: Some("???".into()),
            channel: Some("Channel".into()),
            duration: Some(179.6),
            thumbnails: vec![
                Thumbnail { url: Some("small".into()) },
                Thumbnail { url: Some("large".into()) },
            ],
            url: Some("https://youtu.be/q".into()),
            ..SearchEntry::default()
        });
        assert!(!result.id.is_empty());
        assert_eq!(result.title, UNKNOWN_TITLE);
        assert_eq!(result.artist, "Channel");
        assert_eq!(result.duration, 180);
        assert_eq!(result.thumbnail, "large");
        assert_eq!(result.url, "https://youtu.be/q");
    }

    #[test]
    fn urls_are_checked_against_allowed_hosts() {
        let (_dir, service) = service_with(FakeEngine::default(), |_| {});
        assert!(service.validate_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(service.validate_url("https://youtu.be/abc").is_ok());
        assert!(service.validate_url("https://music.youtube.com/watch?v=abc").is_ok());
        for bad in [
            "",
            "not a url",
            "ftp://youtube.com/x",
            "https://vimeo.com/1",
            "https://notyoutube.com/watch",
        ] {
            assert!(
                matches!(service.validate_url(bad), Err(ServiceError::Validation(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn unknown_quality_is_rejected_without_creating_a_task() {
        let (_dir, service) = service_with(song_engine(), |_| {});
        let err = service
            .start_download("https://youtu.be/abc", Some("ultra"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn download_completes_with_the_resolved_file() {
        let (dir, service) = service_with(song_engine(), |_| {});
        let (task_id, handle) = service
            .start_download("https://youtu.be/abc", Some("medium"))
            .unwrap();
        let done = handle.await.unwrap().unwrap();

        assert_eq!(done.task.status, TaskStatus::Completed);
        assert!(done.task.error.is_none());
        let path = done.task.resolved_file_path.clone().unwrap();
        assert!(path.ends_with("Song Title.mp3"));
        assert_eq!(done.file.filename, "Song Title.mp3");
        assert_eq!(done.file.path, dir.path().join("Song Title.mp3").to_string_lossy());

        let task = service.task(&task_id).unwrap();
        assert_eq!(task.title.as_deref(), Some("Song Title"));
        assert_eq!(task.artist.as_deref(), Some("Artist"));
        assert_eq!(task.progress, 100.0);
    }

    #[tokio::test]
    async fn requested_quality_reaches_the_engine() {
        let engine = Arc::new(song_engine());
        let dir = tempdir().unwrap();
        let settings = RuntimeSettings {
            downloads_dir: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        };
        let store = Arc::new(InMemoryTaskStore::new(Arc::new(FixedClock::new())));
        let service = DownloadService::new(engine.clone(), store, Arc::new(settings));
        let (_id, handle) = service
            .start_download("https://youtu.be/abc", Some("low"))
            .unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(engine.seen_options.lock().as_ref().unwrap().bitrate_kbps, 128);
    }

    #[tokio::test]
    async fn engine_failure_marks_the_task_failed_with_its_reason() {
        let engine = FakeEngine {
            fail_download: Some(FailureReason::Unavailable),
            ..song_engine()
        };
        let (_dir, service) = service_with(engine, |_| {});
        let (task_id, handle) = service.start_download("https://youtu.be/abc", None).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceError::Download(_)));

        let task = service.task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("unavailable"));
        assert!(task.resolved_file_path.is_none());
    }

    #[tokio::test]
    async fn missing_output_fails_resolution() {
        let engine = FakeEngine {
            write_file: None,
            ..song_engine()
        };
        let (_dir, service) = service_with(engine, |_| {});
        let (task_id, handle) = service.start_download("https://youtu.be/abc", None).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Resolution(ResolutionError::FileNotFoundAfterDownload { .. })
        ));
        assert_eq!(service.task(&task_id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn missing_title_fails_during_extraction() {
        let engine = FakeEngine::default();
        let (_dir, service) = service_with(engine, |_| {});
        let (task_id, handle) = service
            .start_download("https://youtu.be/untitled", None)
            .unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(ServiceError::Extraction(ExtractionError::MissingTitle { .. }))
        ));
        let task = service.task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.title.is_none());
    }

    #[tokio::test]
    async fn unusable_title_gets_a_placeholder_and_falls_back_to_newest_file() {
        let engine = FakeEngine {
            title: "???".into(),
            write_file: Some("whatever.mp3".into()),
            ..FakeEngine::default()
        };
        let (_dir, service) = service_with(engine, |_| {});
        let (task_id, handle) = service.start_download("https://youtu.be/abc", None).unwrap();
        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.file.filename, "whatever.mp3");
        assert!(done.task.title.unwrap().starts_with("track-"));
        assert_eq!(service.task(&task_id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn isolated_output_lands_in_the_shared_directory() {
        let (dir, service) = service_with(song_engine(), |settings| {
            settings.isolate_task_output = true;
        });
        fs::write(dir.path().join("Unrelated.mp3"), b"x").unwrap();
        let (task_id, handle) = service.start_download("https://youtu.be/abc", None).unwrap();
        let done = handle.await.unwrap().unwrap();

        assert_eq!(
            done.task.resolved_file_path.unwrap(),
            dir.path().join("Song Title.mp3")
        );
        assert!(!service.downloads().scratch_dir(&task_id).exists());
        assert_eq!(service.list_downloads().await.len(), 2);
    }

    #[tokio::test]
    async fn delete_and_listing_go_through_the_downloads_dir() {
        let (dir, service) = service_with(FakeEngine::default(), |_| {});
        fs::write(dir.path().join("a.mp3"), b"x").unwrap();
        assert_eq!(service.list_downloads().await.len(), 1);
        service.delete_download("a.mp3").await.unwrap();
        assert!(service.list_downloads().await.is_empty());
        assert!(matches!(
            service.delete_download("../a.mp3").await,
            Err(ServiceError::InvalidFilename)
        ));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (_dir, service) = service_with(FakeEngine::default(), |_| {});
        assert!(matches!(
            service.task("ghost"),
            Err(ServiceError::Task(crate::tasks::TaskError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn search_is_not_queued_behind_busy_downloads() {
        let engine = FakeEngine::default();
        engine
            .search_answers
            .lock()
            .push(("bad bunny".into(), Ok(vec![entry("a", "Song A")])));
        let (_dir, service) = service_with(engine, |settings| {
            settings.max_concurrent_downloads = 1;
        });
        let _busy = service.workers.clone().acquire_owned().await.unwrap();

        let results = tokio::time::timeout(Duration::from_secs(5), service.search("bad bunny"))
            .await
            .expect("search waited on a download permit")
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn health_reports_the_ffmpeg_found_at_startup() {
        let (dir, service) = service_with(FakeEngine::default(), |settings| {
            settings.engine.ffmpeg_location = Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        });
        let info = service.system_info(0);
        assert!(info.ffmpeg_available);
        assert_eq!(info.ffmpeg_path.as_deref(), Some("/opt/ffmpeg/bin/ffmpeg"));
        assert!(info.downloads_ok);
        drop(dir);

        let hint = tempdir().unwrap();
        let ffmpeg = hint.path().join("ffmpeg");
        fs::write(&ffmpeg, b"").unwrap();
        let (_dir, service) = service_with(FakeEngine::default(), |settings| {
            settings.ffmpeg_hint = Some(ffmpeg.clone());
        });
        // Unresolved at startup means unavailable; the hint is not probed again.
        assert!(!service.system_info(0).ffmpeg_available);
    }
}
