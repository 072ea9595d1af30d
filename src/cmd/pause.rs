//! The `pause` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*, task::TaskController, ui::Ui};

/// Pause a running task. The task finishes its in-flight requests,
/// saves a checkpoint, and can be resumed later without losing or
/// duplicating work.
#[derive(Debug, Args)]
pub struct PauseOpts {
    /// The task to pause.
    pub task_id: String,
}

/// Run the `pause` subcommand.
#[instrument(level = "debug", skip_all, fields(task_id = %opts.task_id))]
pub async fn cmd_pause(ui: &Ui, config: Config, opts: PauseOpts) -> Result<()> {
    let controller = TaskController::new(config, ui.clone());
    controller.pause(&opts.task_id).await?;
    println!("paused {}", opts.task_id);
    Ok(())
}
