//! The `resume` subcommand.

use clap::Args;

use crate::{
    config::Config, params::ParamOverrides, prelude::*, task::TaskController, ui::Ui,
};

/// Resume a paused or interrupted task.
#[derive(Debug, Args)]
pub struct ResumeOpts {
    /// The task to resume.
    pub task_id: String,

    /// Fork into a new task id, cloning the output so the original
    /// task's files stay untouched.
    #[clap(long = "as-new")]
    pub resume_as_new: bool,

    /// Parameter overrides. The model, concurrency, sampling, and
    /// rate/backoff settings may change; the strategy, input, fan-out
    /// count, and target field may not.
    #[clap(flatten)]
    pub overrides: ParamOverrides,
}

/// Run the `resume` subcommand.
#[instrument(level = "debug", skip_all, fields(task_id = %opts.task_id))]
pub async fn cmd_resume(ui: &Ui, config: Config, opts: ResumeOpts) -> Result<()> {
    let controller = TaskController::new(config, ui.clone());
    controller
        .resume(&opts.task_id, &opts.overrides, opts.resume_as_new)
        .await?;
    Ok(())
}
