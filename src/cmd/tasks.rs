//! The `tasks` subcommand.

use clap::Args;

use crate::{config::Config, prelude::*, task::TaskController, ui::Ui};

/// List known tasks and their progress.
#[derive(Debug, Args)]
pub struct TasksOpts {}

/// Run the `tasks` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_tasks(ui: &Ui, config: Config, _opts: TasksOpts) -> Result<()> {
    let controller = TaskController::new(config, ui.clone());
    let tasks = controller.list().await?;
    if tasks.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    println!(
        "{:<24} {:<14} {:<12} {:<10} {:>8}  {}",
        "TASK", "STRATEGY", "MODEL", "STATUS", "PROGRESS", "STARTED"
    );
    for task in tasks {
        let started = task
            .started_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{:<24} {:<14} {:<12} {:<10} {:>7.1}%  {}",
            task.task_id,
            task.params.strategy.as_str(),
            task.params.model_id,
            task.status,
            task.progress * 100.0,
            started,
        );
    }
    Ok(())
}
