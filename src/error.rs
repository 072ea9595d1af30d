//! Error taxonomy for the distillation engine.
//!
//! Job-path errors (model failures, quality failures) travel as values
//! inside job results so the scheduler can aggregate them; the variants
//! here are the errors that surface to the caller of `start`/`resume`
//! and ultimately decide the process exit code.

use thiserror::Error;

/// Top-level errors surfaced by task operations.
#[derive(Debug, Error)]
pub enum DistillError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("input error: {0}")]
    Input(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl DistillError {
    /// The process exit code for this error: 2 for configuration
    /// errors, 3 for I/O errors, 4 for task failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            DistillError::Config(_) => 2,
            DistillError::Input(_) => 2,
            DistillError::TaskNotFound(_) => 2,
            DistillError::Io(_) => 3,
            DistillError::TaskFailed(_) => 4,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DistillError::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        DistillError::Io(msg.into())
    }
}

impl From<std::io::Error> for DistillError {
    fn from(err: std::io::Error) -> Self {
        DistillError::Io(err.to_string())
    }
}

/// Find the exit code for an error chain. Walks an [`anyhow::Error`]
/// looking for a [`DistillError`]; anything else is treated as an I/O
/// failure.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<DistillError>() {
            return err.exit_code();
        }
    }
    3
}
