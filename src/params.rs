//! Typed run parameters.
//!
//! The user-supplied option mapping is parsed exactly once, here, into
//! a validated struct. Everything downstream sees typed values only;
//! invalid or missing parameters are rejected before any state is
//! created.

use crate::{
    config::ConfigDefaults,
    error::DistillError,
    prelude::*,
    strategy::StrategyKind,
};

/// The full parameter snapshot for one distillation run.
///
/// Persisted verbatim into `TaskState.params` and `task_params.json`
/// so that `resume` can reconstruct the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillParams {
    /// Input dataset (`.jsonl` or `.json`).
    pub input_path: PathBuf,

    /// Output JSONL file.
    pub output_path: PathBuf,

    /// Generation strategy.
    pub strategy: StrategyKind,

    /// Registry id of the model to call.
    pub model_id: String,

    /// Generations per input record, for strategies that fan out.
    pub generation_count: u32,

    /// Field the generated content is written to.
    pub target_field: String,

    /// Field holding the question, for `q_to_a`.
    pub q_field_name: String,

    /// Fields participating in generation (`expand`). Empty means all.
    #[serde(default)]
    pub selected_fields: Vec<String>,

    /// Allowed labels for `classify_label`.
    #[serde(default)]
    pub label_set: Vec<String>,

    /// Optional user prompts.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub q_prompt: Option<String>,
    #[serde(default)]
    pub a_prompt: Option<String>,

    /// Concurrency.
    pub workers: usize,
    pub inflight_multiplier: usize,

    /// Durability cadence.
    pub fsync_interval: usize,
    pub checkpoint_interval: u64,

    /// Token-bucket rate, requests per second. `None` disables limiting.
    #[serde(default)]
    pub rate_limit_rps: Option<f64>,

    /// Retry backoff cap, in seconds.
    pub max_backoff: f64,

    /// Emit outputs as completions arrive instead of in input order.
    pub unordered_write: bool,

    /// Sampling parameters.
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Per-request timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl DistillParams {
    /// Fan-out for this run: `generation_count` jobs per record for
    /// strategies that accept a count, otherwise one.
    pub fn fanout_total(&self) -> u32 {
        if self.strategy.supports_count() {
            self.generation_count.max(1)
        } else {
            1
        }
    }

    /// In-flight job cap.
    pub fn inflight_cap(&self) -> usize {
        self.workers.saturating_mul(self.inflight_multiplier).max(1)
    }

    /// Validate every field. Total: callers must not create any state
    /// before this returns `Ok`.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(DistillError::Config(msg).into()) };

        if self.workers == 0 {
            return fail("workers must be at least 1".into());
        }
        if self.inflight_multiplier == 0 {
            return fail("inflight_multiplier must be at least 1".into());
        }
        if self.fsync_interval == 0 {
            return fail("fsync_interval must be at least 1".into());
        }
        if self.checkpoint_interval == 0 {
            return fail("checkpoint_interval must be at least 1".into());
        }
        if self.generation_count == 0 {
            return fail("generation_count must be at least 1".into());
        }
        if self.timeout_ms == 0 {
            return fail("timeout_ms must be at least 1".into());
        }
        if !(self.max_backoff > 0.0) {
            return fail("max_backoff must be positive".into());
        }
        if let Some(rps) = self.rate_limit_rps
            && !(rps > 0.0)
        {
            return fail(format!("rate_limit_rps must be positive, got {rps}"));
        }
        if let Some(t) = self.temperature
            && !(t > 0.0 && t <= 2.0)
        {
            return fail(format!("temperature must be in (0, 2], got {t}"));
        }
        if let Some(p) = self.top_p
            && !(p > 0.0 && p <= 1.0)
        {
            return fail(format!("top_p must be in (0, 1], got {p}"));
        }
        if let Some(m) = self.max_tokens
            && m == 0
        {
            return fail("max_tokens must be at least 1".into());
        }
        if self.target_field.is_empty() {
            return fail("target_field must not be empty".into());
        }
        if self.q_field_name.is_empty() {
            return fail("q_field_name must not be empty".into());
        }

        self.strategy.validate_params(self)?;
        Ok(())
    }

    /// Apply defaults from the config file to any field the CLI left at
    /// its built-in default marker (`None`).
    pub fn apply_defaults(&mut self, defaults: &ConfigDefaults) {
        if self.temperature.is_none() {
            self.temperature = defaults.temperature;
        }
        if self.top_p.is_none() {
            self.top_p = defaults.top_p;
        }
        if self.top_k.is_none() {
            self.top_k = defaults.top_k;
        }
        if self.max_tokens.is_none() {
            self.max_tokens = defaults.max_tokens;
        }
        if self.rate_limit_rps.is_none() {
            self.rate_limit_rps = defaults.rate_limit_rps;
        }
    }
}

/// Parameter overrides accepted on `resume`.
///
/// The model, concurrency, sampling, and rate/backoff knobs may change
/// freely between runs of a task. The strategy, input file, fan-out
/// count, and target field are part of the task's identity; supplying a
/// different value is a configuration error.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ParamOverrides {
    /// Switch to a different model from the registry.
    #[clap(long = "model")]
    pub model_id: Option<String>,

    /// Worker count.
    #[clap(long)]
    pub workers: Option<usize>,

    /// In-flight cap multiplier.
    #[clap(long)]
    pub inflight_multiplier: Option<usize>,

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

    /// Token-bucket rate limit, requests per second.
    #[clap(long)]
    pub rate_limit_rps: Option<f64>,

    /// Retry backoff cap, in seconds.
    #[clap(long)]
    pub max_backoff: Option<f64>,

    /// Per-request timeout, in milliseconds.
    #[clap(long)]
    pub timeout_ms: Option<u64>,

    /// Must match the original strategy if given.
    #[clap(long, value_enum)]
    pub strategy: Option<StrategyKind>,

    /// Must match the original input file if given.
    #[clap(long)]
    pub input: Option<PathBuf>,

    /// Must match the original fan-out count if given.
    #[clap(long = "count")]
    pub generation_count: Option<u32>,

    /// Must match the original target field if given.
    #[clap(long)]
    pub target_field: Option<String>,
}

impl ParamOverrides {
    /// Merge these overrides into `params`, rejecting any change to a
    /// fixed field. The merged result is re-validated by the caller.
    pub fn merge_into(&self, params: &mut DistillParams) -> Result<()> {
        let mismatch = |what: &str| -> anyhow::Error {
            DistillError::Config(format!(
                "{what} cannot change on resume; start a new task instead"
            ))
            .into()
        };
        if let Some(strategy) = self.strategy
            && strategy != params.strategy
        {
            return Err(mismatch("strategy"));
        }
        if let Some(input) = &self.input
            && *input != params.input_path
        {
            return Err(mismatch("input file"));
        }
        if let Some(count) = self.generation_count
            && count != params.generation_count
        {
            return Err(mismatch("generation count"));
        }
        if let Some(field) = &self.target_field
            && *field != params.target_field
        {
            return Err(mismatch("target field"));
        }

        if let Some(model_id) = &self.model_id {
            params.model_id = model_id.clone();
        }
        if let Some(workers) = self.workers {
            params.workers = workers;
        }
        if let Some(mult) = self.inflight_multiplier {
            params.inflight_multiplier = mult;
        }
        if let Some(t) = self.temperature {
            params.temperature = Some(t);
        }
        if let Some(p) = self.top_p {
            params.top_p = Some(p);
        }
        if let Some(k) = self.top_k {
            params.top_k = Some(k);
        }
        if let Some(m) = self.max_tokens {
            params.max_tokens = Some(m);
        }
        if let Some(rps) = self.rate_limit_rps {
            params.rate_limit_rps = Some(rps);
        }
        if let Some(backoff) = self.max_backoff {
            params.max_backoff = backoff;
        }
        if let Some(timeout) = self.timeout_ms {
            params.timeout_ms = timeout;
        }
        Ok(())
    }
}

/// A reasonable parameter set for unit tests.
#[cfg(test)]
pub(crate) fn test_params() -> DistillParams {
    DistillParams {
        input_path: PathBuf::from("in.jsonl"),
        output_path: PathBuf::from("out.jsonl"),
        strategy: StrategyKind::QToA,
        model_id: "stub".into(),
        generation_count: 1,
        target_field: "output".into(),
        q_field_name: "instruction".into(),
        selected_fields: vec![],
        label_set: vec![],
        system_prompt: None,
        q_prompt: None,
        a_prompt: None,
        workers: 8,
        inflight_multiplier: 4,
        fsync_interval: 50,
        checkpoint_interval: 100,
        rate_limit_rps: None,
        max_backoff: 8.0,
        unordered_write: false,
        temperature: None,
        top_p: None,
        top_k: None,
        max_tokens: None,
        timeout_ms: 60_000,
    }
}
