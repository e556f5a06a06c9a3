//! In-memory registry of download tasks.
//!
//! A task moves strictly forward through
//! `pending → extracting → downloading → completed | failed`. Terminal tasks
//! never change again, and the payload of the terminal transition decides
//! which of `resolved_file_path` / `error` gets filled in, so the two can never
//! be set together.

use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Quality;

pub type TaskId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Extracting,
    Downloading,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Extracting => 1,
            Self::Downloading => 2,
            Self::Completed | Self::Failed => 3,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked download request.
#[derive(Clone, Debug)]
pub struct DownloadTask {
    pub id: TaskId,
    pub source_url: String,
    pub requested_quality: Quality,
    pub status: TaskStatus,
    pub progress: f32,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_seconds: Option<u64>,
    pub thumbnail: Option<String>,
    pub resolved_file_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A forward move together with the fields it is allowed to populate.
#[derive(Clone, Debug)]
pub enum Transition {
    Extracting,
    Downloading {
        title: String,
        artist: String,
        duration_seconds: u64,
        thumbnail: Option<String>,
    },
    Completed {
        path: PathBuf,
    },
    Failed {
        error: String,
    },
}

impl Transition {
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Extracting => TaskStatus::Extracting,
            Self::Downloading { .. } => TaskStatus::Downloading,
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Time source for task timestamps; swapped for a fixed clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Storage contract for download tasks. The production store lives in memory;
/// any key-value backend can implement the same contract.
pub trait TaskStore: Send + Sync {
    /// Allocates a new `pending` task and returns its id.
    fn create(&self, source_url: &str, quality: Quality) -> TaskId;

    /// Applies a forward transition and returns the updated snapshot.
    fn transition(&self, task_id: &str, transition: Transition) -> Result<DownloadTask, TaskError>;

    /// Records download progress. Ignored unless the task is downloading;
    /// values are clamped to `[0, 100]` and never move backwards.
    fn record_progress(&self, task_id: &str, percent: f32) -> Result<(), TaskError>;

    fn get(&self, task_id: &str) -> Result<DownloadTask, TaskError>;

    /// Drops terminal tasks created before `cutoff`. Returns how many went.
    fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize;
}

pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, DownloadTask>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            clock,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, source_url: &str, quality: Quality) -> TaskId {
        let created_at = self.clock.now();
        let mut tasks = self.tasks.lock();
        let mut id = Uuid::new_v4().to_string();
        while tasks.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }
        tasks.insert(
            id.clone(),
            DownloadTask {
                id: id.clone(),
                source_url: source_url.to_string(),
                requested_quality: quality,
                status: TaskStatus::Pending,
                progress: 0.0,
                title: None,
                artist: None,
                duration_seconds: None,
                thumbnail: None,
                resolved_file_path: None,
                error: None,
                created_at,
            },
        );
        debug!(task_id = %id, url = source_url, "task created");
        id
    }

    fn transition(&self, task_id: &str, transition: Transition) -> Result<DownloadTask, TaskError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        let to = transition.target();
        if task.status.is_terminal() || to.rank() <= task.status.rank() {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to,
            });
        }

        match transition {
            Transition::Extracting => {}
            Transition::Downloading {
                title,
                artist,
                duration_seconds,
                thumbnail,
            } => {
                task.title = Some(title);
                task.artist = Some(artist);
                task.duration_seconds = Some(duration_seconds);
                task.thumbnail = thumbnail;
            }
            Transition::Completed { path } => {
                task.resolved_file_path = Some(path);
                task.progress = 100.0;
            }
            Transition::Failed { error } => {
                task.error = Some(error);
            }
        }
        info!(task_id, from = %task.status, to = %to, "task transition");
        task.status = to;
        Ok(task.clone())
    }

    fn record_progress(&self, task_id: &str, percent: f32) -> Result<(), TaskError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if task.status == TaskStatus::Downloading && percent.is_finite() {
            task.progress = task.progress.max(percent.clamp(0.0, 100.0));
        }
        Ok(())
    }

    fn get(&self, task_id: &str) -> Result<DownloadTask, TaskError> {
        self.tasks
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, task| !(task.status.is_terminal() && task.created_at < cutoff));
        before - tasks.len()
    }
}

/// Periodically evicts terminal tasks older than `ttl`.
pub fn spawn_sweeper(
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
) -> JoinHandle<()> {
    let period = ttl.clamp(Duration::from_secs(1), Duration::from_secs(300));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Ok(ttl) = chrono::Duration::from_std(ttl) else {
                return;
            };
            let evicted = store.evict_finished_before(clock.now() - ttl);
            if evicted > 0 {
                info!(evicted, "evicted expired tasks");
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::TimeZone;

    /// Clock that only moves when told to.
    pub struct FixedClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        pub fn new() -> Self {
            Self {
                now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            }
        }

        pub fn advance(&self, by: chrono::Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}
