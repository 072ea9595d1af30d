use std::{process::ExitCode, str::FromStr};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::Config, prelude::*, ui::Ui};

mod checkpoint;
mod cmd;
mod config;
mod error;
mod gateway;
mod input;
mod output;
mod params;
mod prelude;
mod rate_limit;
mod report;
mod retry;
mod scheduler;
mod state;
mod strategy;
mod task;
mod ui;

/// Distill a seed corpus into a larger instruction-tuned corpus with an LLM.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Configuration:
  Models are configured in `distill.toml` (or the file named by
  --config / DISTILL_CONFIG). Each [models.<id>] entry gives the
  backend kind, URL, and the environment variable holding its API key.

  API keys may be set in a standard `.env` file.

Exit codes:
  0  success
  2  configuration error
  3  I/O error
  4  task failure
"#
)]
struct Opts {
    /// Configuration file (TOML or JSON).
    #[clap(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start a new distillation task and run it in the foreground.
    /// Ctrl-C pauses; `distill resume` picks up where it left off.
    Start(cmd::start::StartOpts),
    /// Resume a paused or interrupted task.
    Resume(cmd::resume::ResumeOpts),
    /// Ask a running task to pause.
    Pause(cmd::pause::PauseOpts),
    /// Print a task's quality report as JSON.
    Report(cmd::report::ReportOpts),
    /// List known tasks.
    Tasks(cmd::tasks::TasksOpts),
    /// List configured models.
    Models(cmd::models::ModelsOpts),
}

impl Cmd {
    /// Are we printing machine-readable output to stdout?
    fn using_stdout_for_output(&self) -> bool {
        matches!(self, Cmd::Report(_) | Cmd::Tasks(_) | Cmd::Models(_))
    }
}

/// Our entry point. Errors are printed here and mapped to the exit
/// codes documented in the help text.
#[tokio::main]
async fn main() -> ExitCode {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    match real_main(ui).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(error::exit_code_for(&err))
        }
    }
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Keep stdout clean for commands that print results.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    let config = Config::load(opts.config.as_deref()).await?;

    match opts.subcmd {
        Cmd::Start(start_opts) => cmd::start::cmd_start(&ui, config, start_opts).await,
        Cmd::Resume(resume_opts) => {
            cmd::resume::cmd_resume(&ui, config, resume_opts).await
        }
        Cmd::Pause(pause_opts) => cmd::pause::cmd_pause(&ui, config, pause_opts).await,
        Cmd::Report(report_opts) => {
            cmd::report::cmd_report(&ui, config, report_opts).await
        }
        Cmd::Tasks(tasks_opts) => cmd::tasks::cmd_tasks(&ui, config, tasks_opts).await,
        Cmd::Models(models_opts) => cmd::models::cmd_models(config, models_opts).await,
    }
}
