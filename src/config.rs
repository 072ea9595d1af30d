//! Configuration file and model registry.
//!
//! The config file is TOML or JSON (sniffed by extension, then by first
//! byte) and holds the model registry plus optional defaults for the
//! run parameters. API keys never live in the file itself; entries name
//! an environment variable instead.

use std::collections::BTreeMap;

use tokio::io::AsyncReadExt as _;

use crate::{error::DistillError, prelude::*};

/// Default config file name, looked up in the current directory when
/// `--config` and `$DISTILL_CONFIG` are both absent.
pub const DEFAULT_CONFIG_FILE: &str = "distill.toml";

/// Where task state and control files live by default.
pub const DEFAULT_STATE_DIR: &str = ".distill";

/// The kind of backend a model entry talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// OpenAI-style `/chat/completions` dialect.
    Chat,
    /// vLLM-style `/generate` dialect. The system prompt is concatenated
    /// ahead of the user prompt.
    Completion,
    /// Deterministic offline backend for tests and dry runs.
    Echo,
}

/// One entry in the model registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelEntry {
    /// Which dialect to speak.
    pub kind: ModelKind,

    /// Base URL of the backend. Required for everything except `echo`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Backend model name, when it differs from the registry id.
    #[serde(default)]
    pub model: Option<String>,

    /// Environment variable holding the API key, if the backend needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ModelEntry {
    /// The backend model name to send on the wire.
    pub fn backend_model<'a>(&'a self, id: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(id)
    }

    /// Resolve the API key from the environment, if configured.
    pub fn api_key(&self) -> Result<Option<String>> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => {
                let key = std::env::var(var).map_err(|_| {
                    DistillError::config(format!(
                        "environment variable {var} is not set (needed for API key)"
                    ))
                })?;
                Ok(Some(key))
            }
        }
    }
}

/// Optional defaults applied when the matching CLI flag is absent.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigDefaults {
    pub workers: Option<usize>,
    pub inflight_multiplier: Option<usize>,
    pub fsync_interval: Option<usize>,
    pub checkpoint_interval: Option<u64>,
    pub rate_limit_rps: Option<f64>,
    pub max_backoff: Option<f64>,
    pub timeout_ms: Option<u64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

/// Parsed configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Model registry, keyed by the opaque model id used on the CLI.
    pub models: BTreeMap<String, ModelEntry>,

    /// Defaults for run parameters.
    pub defaults: ConfigDefaults,

    /// Directory for task state and control files.
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Load the configuration, trying `--config`, `$DISTILL_CONFIG`,
    /// then `./distill.toml`. A missing file yields an empty config,
    /// except when the path was given explicitly.
    pub async fn load(explicit: Option<&Path>) -> Result<Config> {
        let (path, required) = match explicit {
            Some(path) => (path.to_owned(), true),
            None => match std::env::var_os("DISTILL_CONFIG") {
                Some(path) => (PathBuf::from(path), true),
                None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
            },
        };
        if !path.exists() {
            if required {
                return Err(DistillError::config(format!(
                    "config file not found: {}",
                    path.display()
                ))
                .into());
            }
            debug!("No config file, using built-in defaults");
            return Ok(Config::default());
        }
        Self::load_from(&path).await
    }

    /// Read TOML or JSON from `path`.
    pub async fn load_from(path: &Path) -> Result<Config> {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        let mut data = String::new();
        // Read all at once because our parsing libraries don't do async I/O.
        file.read_to_string(&mut data)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let is_json = path.extension().is_some_and(|ext| ext == "json")
            || data.trim_start().starts_with('{');
        let config: Config = if is_json {
            serde_json::from_str(&data).map_err(|err| {
                DistillError::config(format!("invalid JSON in {}: {err}", path.display()))
            })?
        } else {
            toml::from_str(&data).map_err(|err| {
                DistillError::config(format!("invalid TOML in {}: {err}", path.display()))
            })?
        };
        debug!(models = config.models.len(), "Loaded config from {}", path.display());
        Ok(config)
    }

    /// Look up a model entry by id.
    pub fn model(&self, id: &str) -> Result<&ModelEntry> {
        self.models.get(id).ok_or_else(|| {
            DistillError::config(format!("model not found in registry: {id:?}")).into()
        })
    }

    /// The state directory, configured or default.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }
}
