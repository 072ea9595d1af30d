//! Task state persistence.
//!
//! The state store is a small key-value contract: task states keyed by
//! task id, each update atomic, no cross-key transactions. The default
//! implementation keeps one JSON file per task in the state directory,
//! rewritten with the tmp-then-rename pattern. The persisted status is
//! the source of truth for CLI consumers polling a task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt as _;

use crate::{error::DistillError, params::DistillParams, prelude::*};

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Can `resume` pick this task back up?
    pub fn is_resumable(self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Failed | TaskStatus::Pending)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything persisted about a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,

    /// Fraction of input indices fully processed, in `[0, 1]`.
    pub progress: f64,

    pub input_total: u64,
    pub input_processed: u64,
    pub outputs_written: u64,

    /// Job-level failures: fatal model errors plus quality failures.
    pub failures: u64,

    /// Outputs produced but rejected by validation (subset of `failures`).
    pub quality_failures: u64,

    /// Malformed input records skipped.
    pub input_errors: u64,

    /// Full parameter snapshot, for resume.
    pub params: DistillParams,

    pub started_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub output_path: PathBuf,
    pub checkpoint_path: PathBuf,

    /// Why the task failed, when it did.
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskState {
    /// A fresh `pending` task.
    pub fn new(task_id: String, params: DistillParams, checkpoint_path: PathBuf) -> Self {
        let output_path = params.output_path.clone();
        Self {
            task_id,
            status: TaskStatus::Pending,
            progress: 0.0,
            input_total: 0,
            input_processed: 0,
            outputs_written: 0,
            failures: 0,
            quality_failures: 0,
            input_errors: 0,
            params,
            started_at: None,
            last_update_at: None,
            finished_at: None,
            output_path,
            checkpoint_path,
            error: None,
        }
    }

    /// Recompute `progress` from the counters.
    pub fn update_progress(&mut self) {
        self.progress = if self.input_total == 0 {
            0.0
        } else {
            (self.input_processed as f64 / self.input_total as f64).clamp(0.0, 1.0)
        };
        self.last_update_at = Some(Utc::now());
    }
}

/// Key-value persistence for task metadata.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, task_id: &str) -> Result<Option<TaskState>>;
    async fn put(&self, state: &TaskState) -> Result<()>;

    /// Update a single field of a task's state. Atomic per task.
    async fn update(&self, task_id: &str, key: &str, value: Value) -> Result<()>;

    async fn list(&self) -> Result<Vec<TaskState>>;
}

/// One JSON file per task under the state directory.
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|err| {
            DistillError::io(format!(
                "failed to create state directory {}: {err}",
                self.dir.display()
            ))
        })?;
        let tmp_path = path.with_extension("json.tmp");
        let io_err = |err: std::io::Error| {
            anyhow::Error::from(DistillError::io(format!(
                "failed to write task state {}: {err}",
                path.display()
            )))
        };
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(data).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskState>> {
        let path = self.task_path(task_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(DistillError::io(format!(
                    "failed to read task state {}: {err}",
                    path.display()
                ))
                .into());
            }
        };
        let state = serde_json::from_str(&data).with_context(|| {
            format!("corrupt task state file {}", path.display())
        })?;
        Ok(Some(state))
    }

    async fn put(&self, state: &TaskState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)
            .context("failed to serialize task state")?;
        self.write_atomic(&self.task_path(&state.task_id), &data).await
    }

    async fn update(&self, task_id: &str, key: &str, value: Value) -> Result<()> {
        let state = self.get(task_id).await?.ok_or_else(|| {
            DistillError::TaskNotFound(task_id.to_owned())
        })?;
        let mut raw = serde_json::to_value(&state)
            .context("failed to serialize task state")?;
        let object = raw.as_object_mut().expect("task state is an object");
        object.insert(key.to_owned(), value);
        let updated: TaskState = serde_json::from_value(raw)
            .with_context(|| format!("invalid value for task state key {key:?}"))?;
        self.put(&updated).await
    }

    async fn list(&self) -> Result<Vec<TaskState>> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(DistillError::io(format!(
                    "failed to list state directory {}: {err}",
                    self.dir.display()
                ))
                .into());
            }
        };
        let mut tasks = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .context("failed to list state directory")?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(data) => match serde_json::from_str::<TaskState>(&data) {
                    Ok(state) => tasks.push(state),
                    Err(err) => {
                        warn!("Skipping unreadable task state {}: {err}", path.display());
                    }
                },
                Err(err) => {
                    warn!("Skipping unreadable task state {}: {err}", path.display());
                }
            }
        }
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(tasks)
    }
}

/// Cross-process pause requests: a sentinel file in the state
/// directory, polled by the running scheduler.
pub struct PauseFlag {
    path: PathBuf,
}

impl PauseFlag {
    pub fn new(state_dir: &Path, task_id: &str) -> Self {
        Self {
            path: state_dir.join(format!("{task_id}.pause")),
        }
    }

    /// Ask the running task to pause.
    pub async fn raise(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&self.path, b"pause\n").await.map_err(|err| {
            DistillError::io(format!(
                "failed to write pause flag {}: {err}",
                self.path.display()
            ))
            .into()
        })
    }

    pub fn is_raised(&self) -> bool {
        self.path.exists()
    }

    pub async fn clear(&self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}
