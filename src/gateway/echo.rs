//! Echo gateway for tests and dry runs.
//!
//! Returns the rendered prompt as the completion, so a full pipeline
//! run can be exercised offline and the output inspected for exactly
//! what would have been sent to a real model.

use async_trait::async_trait;

use super::{GenerationRequest, ModelError, ModelGateway};

/// Deterministic offline backend.
#[derive(Debug, Default)]
pub struct EchoGateway;

impl EchoGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelGateway for EchoGateway {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ModelError> {
        Ok(request.prompt.clone())
    }
}
