//! HTTP surface. Handlers stay thin: validation and orchestration live in
//! `service`, this module only shapes JSON and streams files.

use std::path::{Path, PathBuf};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error};

use crate::{
    engine::Quality,
    error::ServiceError,
    files::is_audio,
    service::{CompletedDownload, DownloadService},
    tasks::{DownloadTask, TaskError, TaskStatus},
};

const DOWNLOAD_CACHE_CONTROL: &str = "public, max-age=31536000";
const PLAYBACK_CACHE_CONTROL: &str = "no-cache";

#[derive(Clone)]
pub struct AppState {
    pub service: DownloadService,
}

impl AppState {
    pub fn new(service: DownloadService) -> Self {
        Self { service }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/search", post(search))
        .route("/download", post(start_download))
        .route("/tasks/{id}", get(task_status))
        .route("/downloads", get(list_downloads))
        .route(
            "/download/{*filename}",
            get(download_file).delete(delete_file),
        )
        .route("/file/{*filename}", get(play_file))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Validation(_) | ServiceError::InvalidFilename => StatusCode::BAD_REQUEST,
            ServiceError::FileMissing(_) | ServiceError::Task(TaskError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(%err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn root() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "features": [
            "search",
            "mp3 download",
            "task polling",
            "file streaming",
            "range requests",
        ],
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let downloads = state.service.list_downloads().await;
    let system = state.service.system_info(downloads.len());
    Json(json!({
        "status": "healthy",
        "total": downloads.len(),
        "downloads": downloads,
        "system": system,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    let query = params.query.unwrap_or_default();
    let results = state.service.search(&query).await?;
    Ok(Json(json!({
        "status": "success",
        "total": results.len(),
        "results": results,
        "query": query.trim(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub url: Option<String>,
    pub quality: Option<String>,
    pub wait: Option<bool>,
}

#[derive(Debug, Serialize)]
struct FilePayload {
    title: String,
    artist: String,
    duration: u64,
    thumbnail: String,
    file_path: String,
    file_size: u64,
    filename: String,
}

impl From<&CompletedDownload> for FilePayload {
    fn from(done: &CompletedDownload) -> Self {
        Self {
            title: done.task.title.clone().unwrap_or_else(|| done.file.title.clone()),
            artist: done.task.artist.clone().unwrap_or_default(),
            duration: done.task.duration_seconds.unwrap_or(0),
            thumbnail: done.task.thumbnail.clone().unwrap_or_default(),
            file_path: done.file.path.clone(),
            file_size: done.file.size,
            filename: done.file.filename.clone(),
        }
    }
}

async fn start_download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> ApiResult<Response> {
    let url = params.url.unwrap_or_default();
    let (task_id, handle) = state
        .service
        .start_download(&url, params.quality.as_deref())?;

    if !params.wait.unwrap_or(true) {
        let body = json!({ "status": "accepted", "task_id": task_id });
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let done = handle
        .await
        .map_err(|err| ApiError::internal(format!("download worker stopped: {err}")))??;
    Ok(Json(json!({
        "status": "success",
        "task_id": task_id,
        "file": FilePayload::from(&done),
    }))
    .into_response())
}

#[derive(Debug, Serialize)]
struct TaskView {
    task_id: String,
    status: TaskStatus,
    progress: f32,
    title: Option<String>,
    artist: Option<String>,
    duration: Option<u64>,
    thumbnail: Option<String>,
    quality: Quality,
    source_url: String,
    file_path: Option<String>,
    error: Option<String>,
    created_at: i64,
}

impl From<DownloadTask> for TaskView {
    fn from(task: DownloadTask) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            progress: task.progress,
            title: task.title,
            artist: task.artist,
            duration: task.duration_seconds,
            thumbnail: task.thumbnail,
            quality: task.requested_quality,
            source_url: task.source_url,
            file_path: task
                .resolved_file_path
                .map(|path| path.to_string_lossy().into_owned()),
            error: task.error,
            created_at: task.created_at.timestamp(),
        }
    }
}

async fn task_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<TaskView>> {
    Ok(Json(state.service.task(&id)?.into()))
}

async fn list_downloads(State(state): State<AppState>) -> Json<Value> {
    let downloads = state.service.list_downloads().await;
    Json(json!({
        "status": "success",
        "total": downloads.len(),
        "downloads": downloads,
    }))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = state.service.downloads().locate(&filename)?;
    let mut response = stream_file(path, &headers, DOWNLOAD_CACHE_CONTROL).await?;
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&filename)) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn play_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = state.service.downloads().locate(&filename)?;
    if !is_audio(&path) {
        return Err(ApiError::bad_request(format!(
            "unsupported file type: {filename}"
        )));
    }
    stream_file(path, &headers, PLAYBACK_CACHE_CONTROL).await
}

async fn delete_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    state.service.delete_download(&filename).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("deleted {filename}"),
    })))
}

/// Streams `path`, honouring a single `Range` header. Empty files are
/// treated as broken downloads.
async fn stream_file(
    path: PathBuf,
    headers: &HeaderMap,
    cache_control: &'static str,
) -> ApiResult<Response> {
    let mut file = File::open(&path).await.map_err(|err| open_error(&path, err))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| ApiError::from(ServiceError::from(err)))?
        .len();
    if size == 0 {
        return Err(ApiError::bad_request("file is empty or corrupt"));
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        } else {
            let end = end.min(size - 1);
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::from(ServiceError::from(err)))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        response
    };

    debug!(path = %path.display(), status = %response.status(), "serving file");
    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(media_type(&path)));
    Ok(response)
}

/// A file removed after lookup is reported as missing, not as a server fault.
fn open_error(path: &Path, err: std::io::Error) -> ApiError {
    if err.kind() == std::io::ErrorKind::NotFound {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        ApiError::from(ServiceError::FileMissing(name))
    } else {
        ApiError::from(ServiceError::from(err))
    }
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}

/// Audio types first, then whatever `mime_guess` knows, then MP3.
fn media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "webm" => "audio/webm",
        "wav" => "audio/wav",
        _ => MimeGuess::from_path(path)
            .first_raw()
            .unwrap_or("audio/mpeg"),
    }
}

/// `attachment` disposition with non-ASCII and quoting characters dropped.
fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control() && *c != '"' && *c != '\\')
        .collect();
    let ascii = ascii.trim();
    let ascii = if ascii.is_empty() { "download.mp3" } else { ascii };
    format!("attachment; filename=\"{ascii}\"")
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        // Open-ended; an unsatisfiable start is left for the caller to 416.
        size.saturating_sub(1).max(start)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
