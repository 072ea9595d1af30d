//! The `start` subcommand.

use clap::Args;

use crate::{
    config::Config,
    params::DistillParams,
    prelude::*,
    strategy::StrategyKind,
    task::TaskController,
    ui::Ui,
};

use super::split_csv;

/// Start a new distillation task.
#[derive(Debug, Args)]
pub struct StartOpts {
    /// Input dataset, in JSONL or JSON format.
    #[clap(short = 'i', long)]
    pub input: PathBuf,

    /// Generation strategy.
    #[clap(short = 's', long, value_enum)]
    pub strategy: StrategyKind,

    /// Model id from the registry in the config file.
    #[clap(short = 'm', long)]
    pub model: String,

    /// Output location, in JSONL format. Defaults to the input path
    /// with a `.distilled.jsonl` suffix.
    #[clap(short = 'o', long = "out")]
    pub output: Option<PathBuf>,

    /// Generations per input record, for strategies that fan out.
    #[clap(long = "count")]
    pub generation_count: Option<u32>,

    /// Field the generated content is written to.
    #[clap(long)]
    pub target_field: Option<String>,

    /// Field holding the question, for `q_to_a`.
    #[clap(long)]
    pub q_field_name: Option<String>,

    /// Comma-separated fields participating in generation (`expand`).
    #[clap(long = "fields")]
    pub selected_fields: Option<String>,

    /// Comma-separated label set (`classify_label`).
    #[clap(long = "labels")]
    pub label_set: Option<String>,

    /// System prompt applied to every request.
    #[clap(long)]
    pub system_prompt: Option<String>,

    /// Question template (`q_to_a`, `custom`).
    #[clap(long)]
    pub q_prompt: Option<String>,

    /// Answer template (`q_to_a`, `custom`).
    #[clap(long)]
    pub a_prompt: Option<String>,

    /// Worker count.
    #[clap(short = 'j', long)]
    pub workers: Option<usize>,

    /// In-flight cap = workers times this.
    #[clap(long)]
    pub inflight_multiplier: Option<usize>,

    /// Output lines between fsyncs.
    #[clap(long)]
    pub fsync_interval: Option<usize>,

    /// Committed records between checkpoint saves.
    #[clap(long)]
    pub checkpoint_interval: Option<u64>,

    /// Token-bucket rate limit, requests per second. Unset disables it.
    #[clap(long)]
    pub rate_limit_rps: Option<f64>,

    /// Retry backoff cap, in seconds.
    #[clap(long)]
    pub max_backoff: Option<f64>,

    /// Write outputs as completions arrive instead of in input order.
    /// Higher throughput; lines carry `_gen_index`/`_gen_seq` so the
    /// stream stays reorderable offline.
    #[clap(long = "unordered")]
    pub unordered_write: bool,

    /// Sampling temperature, in (0, 2].
    #[clap(long)]
    pub temperature: Option<f32>,

    /// Top-p sampling value, in (0, 1].
    #[clap(long)]
    pub top_p: Option<f32>,

    /// Top-k sampling value; 0 means unset.
    #[clap(long)]
    pub top_k: Option<u32>,

    /// Completion token cap.
    #[clap(long)]
    pub max_tokens: Option<u32>,

    /// Per-request timeout, in milliseconds.
    #[clap(long)]
    pub timeout_ms: Option<u64>,
}

impl StartOpts {
    /// Resolve CLI flags, config-file defaults, and built-in defaults
    /// into a full parameter set.
    pub fn into_params(self, config: &Config) -> DistillParams {
        let defaults = &config.defaults;
        let output_path = self.output.unwrap_or_else(|| {
            let stem = self
                .input
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dataset".to_owned());
            self.input.with_file_name(format!("{stem}.distilled.jsonl"))
        });
        DistillParams {
            input_path: self.input,
            output_path,
            strategy: self.strategy,
            model_id: self.model,
            generation_count: self.generation_count.unwrap_or(1),
            target_field: self.target_field.unwrap_or_else(|| "output".to_owned()),
            q_field_name: self
                .q_field_name
                .unwrap_or_else(|| "instruction".to_owned()),
            selected_fields: split_csv(self.selected_fields.as_deref()),
            label_set: split_csv(self.label_set.as_deref()),
            system_prompt: self.system_prompt,
            q_prompt: self.q_prompt,
            a_prompt: self.a_prompt,
            workers: self.workers.or(defaults.workers).unwrap_or(8),
            inflight_multiplier: self
                .inflight_multiplier
                .or(defaults.inflight_multiplier)
                .unwrap_or(4),
            fsync_interval: self
                .fsync_interval
                .or(defaults.fsync_interval)
                .unwrap_or(50),
            checkpoint_interval: self
                .checkpoint_interval
                .or(defaults.checkpoint_interval)
                .unwrap_or(100),
            rate_limit_rps: self.rate_limit_rps.or(defaults.rate_limit_rps),
            max_backoff: self.max_backoff.or(defaults.max_backoff).unwrap_or(8.0),
            unordered_write: self.unordered_write,
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            top_k: self.top_k.or(defaults.top_k),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            timeout_ms: self.timeout_ms.or(defaults.timeout_ms).unwrap_or(60_000),
        }
    }
}

/// Run the `start` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_start(ui: &Ui, config: Config, opts: StartOpts) -> Result<()> {
    let params = opts.into_params(&config);
    let controller = TaskController::new(config, ui.clone());
    controller.start(params).await?;
    Ok(())
}
