//! The `report` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*, task::TaskController, ui::Ui};

/// Print the quality report for a task as JSON.
#[derive(Debug, Args)]
pub struct ReportOpts {
    /// The task to report on.
    pub task_id: String,
}

/// Run the `report` subcommand.
#[instrument(level = "debug", skip_all, fields(task_id = %opts.task_id))]
pub async fn cmd_report(ui: &Ui, config: Config, opts: ReportOpts) -> Result<()> {
    let controller = TaskController::new(config, ui.clone());
    let report = controller.report(&opts.task_id).await?;
    let json = serde_json::to_string_pretty(&report)
        .context("failed to serialize quality report")?;
    println!("{json}");
    Ok(())
}
