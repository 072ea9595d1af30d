//! The task controller: start, resume, pause, report.
//!
//! The controller owns the task record in the state store and wires the
//! scheduler to its collaborators: the model gateway, the progress bar,
//! the pause signals (Ctrl-C in the foreground, a control file from
//! another process), and the single state-updater task that is the only
//! writer of persisted `TaskState` while a run is in flight.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{StreamExt as _, channel::mpsc};
use tokio::time::Instant;

use crate::{
    checkpoint::CheckpointStore,
    config::Config,
    error::DistillError,
    gateway::create_gateway,
    params::{DistillParams, ParamOverrides},
    prelude::*,
    report::{self, QUALITY_REPORT_FILE, QualityReport},
    scheduler::{ProgressSnapshot, RunControl, RunOutcome, RunStart, run},
    state::{JsonStateStore, PauseFlag, StateStore, TaskState, TaskStatus},
    ui::Ui,
};

/// Parameter snapshot written next to the output file on every run.
pub const TASK_PARAMS_FILE: &str = "task_params.json";

/// How often the running task checks for a pause request.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How often the state task persists progress.
const PERSIST_INTERVAL: Duration = Duration::from_millis(500);

/// Public façade over the distillation engine.
pub struct TaskController {
    config: Config,
    store: Arc<dyn StateStore>,
    state_dir: PathBuf,
    ui: Ui,
}

impl TaskController {
    pub fn new(config: Config, ui: Ui) -> Self {
        let state_dir = config.state_dir();
        let store = Arc::new(JsonStateStore::new(state_dir.clone()));
        Self {
            config,
            store,
            state_dir,
            ui,
        }
    }

    /// Validate `params`, create the task record, and run it to its
    /// first terminal state. Returns the task id. No state is created
    /// when validation fails.
    pub async fn start(&self, mut params: DistillParams) -> Result<String> {
        params.apply_defaults(&self.config.defaults);
        params.validate()?;
        self.config.model(&params.model_id)?;
        if !params.input_path.exists() {
            return Err(DistillError::config(format!(
                "input file not found: {}",
                params.input_path.display()
            ))
            .into());
        }

        let task_id = new_task_id();
        let checkpoint_path = CheckpointStore::for_output(&params.output_path)
            .path()
            .to_owned();
        let state = TaskState::new(task_id.clone(), params, checkpoint_path);
        self.store.put(&state).await?;
        info!(%task_id, "Task created");
        println!("{task_id}");

        self.run_task(state, RunStart::default()).await?;
        Ok(task_id)
    }

    /// Resume a paused or failed task, optionally with overrides, and
    /// optionally as a fork under a fresh task id.
    pub async fn resume(
        &self,
        task_id: &str,
        overrides: &ParamOverrides,
        as_new: bool,
    ) -> Result<String> {
        let mut state = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| DistillError::TaskNotFound(task_id.to_owned()))?;
        if state.status == TaskStatus::Running {
            return Err(DistillError::config(format!(
                "task {task_id} is already running"
            ))
            .into());
        }
        if !state.status.is_resumable() && state.status != TaskStatus::Completed {
            return Err(DistillError::config(format!(
                "task {task_id} is {} and cannot be resumed",
                state.status
            ))
            .into());
        }
        overrides.merge_into(&mut state.params)?;
        state.params.validate()?;
        self.config.model(&state.params.model_id)?;

        if as_new {
            state = self.fork_task(&state).await?;
            info!(task_id = %state.task_id, "Forked task");
            println!("{}", state.task_id);
        }

        let checkpoint = CheckpointStore::for_output(&state.params.output_path)
            .load()
            .await?;
        let start = RunStart {
            checkpoint,
            failures: state.failures,
            quality_failures: state.quality_failures,
            input_errors: state.input_errors,
        };
        let resumed_id = state.task_id.clone();
        state.output_path = state.params.output_path.clone();
        self.store.put(&state).await?;
        self.run_task(state, start).await?;
        Ok(resumed_id)
    }

    /// Ask a running task to pause, and wait until it has.
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let state = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| DistillError::TaskNotFound(task_id.to_owned()))?;
        if state.status != TaskStatus::Running {
            return Err(DistillError::config(format!(
                "task {task_id} is {}, not running",
                state.status
            ))
            .into());
        }

        PauseFlag::new(&self.state_dir, task_id).raise().await?;
        info!(%task_id, "Pause requested");

        // Worst case: one in-flight call per worker has to drain.
        let deadline =
            Instant::now() + Duration::from_millis(state.params.timeout_ms) + Duration::from_secs(5);
        loop {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
            let current = self
                .store
                .get(task_id)
                .await?
                .ok_or_else(|| DistillError::TaskNotFound(task_id.to_owned()))?;
            match current.status {
                TaskStatus::Running => {}
                _ => return Ok(()),
            }
            if Instant::now() >= deadline {
                return Err(DistillError::TaskFailed(format!(
                    "task {task_id} did not pause in time"
                ))
                .into());
            }
        }
    }

    /// The quality report for a task: the persisted one if the task
    /// completed, otherwise computed from the current output and
    /// counters.
    pub async fn report(&self, task_id: &str) -> Result<QualityReport> {
        let state = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| DistillError::TaskNotFound(task_id.to_owned()))?;

        let report_path = state
            .output_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(QUALITY_REPORT_FILE);
        if state.status == TaskStatus::Completed && report_path.exists() {
            let data = tokio::fs::read_to_string(&report_path)
                .await
                .with_context(|| {
                    format!("failed to read report {}", report_path.display())
                })?;
            let report = serde_json::from_str(&data).with_context(|| {
                format!("corrupt quality report {}", report_path.display())
            })?;
            return Ok(report);
        }
        report::build_report(&state).await
    }

    /// All known tasks.
    pub async fn list(&self) -> Result<Vec<TaskState>> {
        self.store.list().await
    }

    /// Drive one run of a task and settle its terminal state.
    async fn run_task(&self, mut state: TaskState, start: RunStart) -> Result<()> {
        let task_id = state.task_id.clone();
        let params = state.params.clone();
        let entry = self.config.model(&params.model_id)?;
        let gateway = create_gateway(&params.model_id, entry)?;

        write_params_snapshot(&params).await?;

        state.status = TaskStatus::Running;
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        state.finished_at = None;
        state.error = None;
        state.update_progress();
        self.store.put(&state).await?;

        let control = RunControl::new();
        let pause_flag = PauseFlag::new(&self.state_dir, &task_id);
        let watcher = spawn_pause_watcher(
            control.clone(),
            PauseFlag::new(&self.state_dir, &task_id),
        );

        let progress_bar = self.ui.new_progress_bar("Distilling records", 0);
        let (progress_tx, mut progress_rx) = mpsc::unbounded::<ProgressSnapshot>();
        let store = self.store.clone();
        let mut tracked = state.clone();
        let bar = progress_bar.clone();
        let state_task = tokio::spawn(async move {
            let mut last_persist = Instant::now();
            while let Some(snapshot) = progress_rx.next().await {
                tracked.input_total = snapshot.input_total;
                tracked.input_processed = snapshot.input_processed;
                tracked.outputs_written = snapshot.outputs_written;
                tracked.failures = snapshot.failures;
                tracked.quality_failures = snapshot.quality_failures;
                tracked.input_errors = snapshot.input_errors;
                tracked.update_progress();
                bar.set_length(snapshot.input_total);
                bar.set_position(snapshot.input_processed);
                if last_persist.elapsed() >= PERSIST_INTERVAL {
                    if let Err(err) = store.put(&tracked).await {
                        warn!("Failed to persist progress: {err}");
                    }
                    last_persist = Instant::now();
                }
            }
            tracked
        });

        let result = run(&params, gateway, control.clone(), progress_tx, start).await;

        watcher.abort();
        progress_bar.finish_and_clear();
        let mut final_state = state_task.await.context("state task panicked")?;
        pause_flag.clear().await;

        match result {
            Ok(summary) => {
                final_state.update_progress();
                match summary.outcome {
                    RunOutcome::Paused => {
                        final_state.status = TaskStatus::Paused;
                        self.store.put(&final_state).await?;
                        info!(%task_id, "Task paused");
                    }
                    RunOutcome::Completed => {
                        final_state.status = TaskStatus::Completed;
                        final_state.finished_at = Some(Utc::now());
                        self.store.put(&final_state).await?;
                        let report = report::build_report(&final_state).await?;
                        report::write_report(&report, &final_state.output_path).await?;
                        info!(%task_id, "Task completed");
                    }
                }
                Ok(())
            }
            Err(err) => {
                final_state.status = TaskStatus::Failed;
                final_state.error = Some(format!("{err:#}"));
                final_state.finished_at = Some(Utc::now());
                self.store.put(&final_state).await?;
                error!(%task_id, "Task failed: {err:#}");
                Err(err)
            }
        }
    }

    /// Fork a task: fresh id, output and checkpoint cloned into a new
    /// directory, the original left untouched.
    async fn fork_task(&self, original: &TaskState) -> Result<TaskState> {
        let task_id = new_task_id();
        let parent = original
            .params
            .output_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let file_name = original
            .params
            .output_path
            .file_name()
            .ok_or_else(|| DistillError::config("output path has no file name"))?;
        let new_dir = parent.join(&task_id);
        tokio::fs::create_dir_all(&new_dir).await.map_err(|err| {
            DistillError::io(format!(
                "failed to create directory {}: {err}",
                new_dir.display()
            ))
        })?;

        let new_output = new_dir.join(file_name);
        copy_if_exists(&original.params.output_path, &new_output).await?;
        let old_checkpoint = CheckpointStore::for_output(&original.params.output_path);
        let new_checkpoint = CheckpointStore::for_output(&new_output);
        copy_if_exists(old_checkpoint.path(), new_checkpoint.path()).await?;

        let mut forked = original.clone();
        forked.task_id = task_id;
        forked.params.output_path = new_output.clone();
        forked.output_path = new_output;
        forked.checkpoint_path = new_checkpoint.path().to_owned();
        forked.started_at = None;
        forked.finished_at = None;
        self.store.put(&forked).await?;
        Ok(forked)
    }
}

/// Watch for Ctrl-C and for the cross-process pause file; either one
/// pauses the run.
fn spawn_pause_watcher(
    control: RunControl,
    pause_flag: PauseFlag,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let poll = async {
            loop {
                if pause_flag.is_raised() {
                    break;
                }
                tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!("Failed to listen for Ctrl-C: {err}");
                    return;
                }
                info!("Interrupt received; pausing after in-flight requests drain");
            }
            _ = poll => {
                info!("Pause file detected; pausing after in-flight requests drain");
            }
        }
        control.pause();
    })
}

/// Write `task_params.json` next to the output file.
async fn write_params_snapshot(params: &DistillParams) -> Result<()> {
    let dir = params
        .output_path
        .parent()
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await.ok();
    let path = dir.join(TASK_PARAMS_FILE);
    let data =
        serde_json::to_vec_pretty(params).context("failed to serialize parameters")?;
    tokio::fs::write(&path, data).await.map_err(|err| {
        DistillError::io(format!(
            "failed to write {}: {err}",
            path.display()
        ))
        .into()
    })
}

async fn copy_if_exists(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::copy(from, to).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(DistillError::io(format!(
            "failed to copy {} to {}: {err}",
            from.display(),
            to.display()
        ))
        .into()),
    }
}

/// Task ids sort by creation time and stay easy to type.
fn new_task_id() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("t{stamp}-{}", &suffix[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ModelEntry, ModelKind},
        params::test_params,
        strategy::StrategyKind,
    };

    fn echo_config(state_dir: &Path) -> Config {
        let mut config = Config::default();
        config.state_dir = Some(state_dir.to_owned());
        config.models.insert(
            "stub".into(),
            ModelEntry {
                kind: ModelKind::Echo,
                base_url: None,
                model: None,
                api_key_env: None,
            },
        );
        config
    }

    fn controller(dir: &Path) -> TaskController {
        TaskController::new(echo_config(&dir.join("state")), Ui::init())
    }

    fn params_in(dir: &Path) -> DistillParams {
        let input = dir.join("input.jsonl");
        std::fs::write(
            &input,
            "{\"instruction\":\"q0\"}\n{\"instruction\":\"q1\"}\n",
        )
        .unwrap();
        let mut params = test_params();
        params.input_path = input;
        params.output_path = dir.join("run").join("out.jsonl");
        params
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let params = params_in(dir.path());

        let task_id = controller.start(params.clone()).await.unwrap();
        let tasks = controller.list().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, task_id);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].outputs_written, 2);
        assert_eq!(tasks[0].progress, 1.0);

        // Siblings: params snapshot, checkpoint, quality report.
        let run_dir = params.output_path.parent().unwrap();
        assert!(run_dir.join(TASK_PARAMS_FILE).exists());
        assert!(run_dir.join("checkpoint.json").exists());
        assert!(run_dir.join(QUALITY_REPORT_FILE).exists());

        let report = controller.report(&task_id).await.unwrap();
        assert_eq!(report.quality_passed_items, 2);
        assert_eq!(report.quality_pass_rate, 1.0);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_params_without_creating_state() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let mut params = params_in(dir.path());
        params.strategy = StrategyKind::ClassifyLabel;
        params.label_set = vec![];

        let err = controller.start(params).await.unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
        assert!(controller.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let mut params = params_in(dir.path());
        params.model_id = "nonexistent".into();

        let err = controller.start(params).await.unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[tokio::test]
    async fn test_resume_completed_as_new_forks_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let params = params_in(dir.path());

        let task_id = controller.start(params.clone()).await.unwrap();
        let new_id = controller
            .resume(&task_id, &ParamOverrides::default(), true)
            .await
            .unwrap();
        assert_ne!(new_id, task_id);

        let tasks = controller.list().await.unwrap();
        assert_eq!(tasks.len(), 2);
        let forked = tasks.iter().find(|t| t.task_id == new_id).unwrap();
        assert_eq!(forked.status, TaskStatus::Completed);
        assert_ne!(forked.output_path, params.output_path);
        // The original output is untouched.
        assert_eq!(
            std::fs::read_to_string(&params.output_path)
                .unwrap()
                .lines()
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_resume_rejects_identity_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let params = params_in(dir.path());

        let task_id = controller.start(params).await.unwrap();
        let overrides = ParamOverrides {
            strategy: Some(StrategyKind::Expand),
            ..ParamOverrides::default()
        };
        let err = controller
            .resume(&task_id, &overrides, false)
            .await
            .unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[tokio::test]
    async fn test_pause_rejects_tasks_that_are_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());
        let params = params_in(dir.path());

        let task_id = controller.start(params).await.unwrap();
        let err = controller.pause(&task_id).await.unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);

        let err = controller.pause("no-such-task").await.unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }
}
