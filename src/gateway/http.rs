//! HTTP gateway for chat-style and completion-style backends.
//!
//! The `chat` dialect speaks OpenAI's `/chat/completions`; the
//! `completion` dialect speaks a vLLM-style `/generate`. Both are
//! normalized here so the rest of the engine never sees vendor shapes.

use std::time::Duration;

use reqwest::StatusCode;

use crate::{
    config::{ModelEntry, ModelKind},
    error::DistillError,
    prelude::*,
};

use super::{GenerationRequest, ModelError, ModelGateway};

/// Gateway for HTTP backends.
#[derive(Debug)]
pub struct HttpGateway {
    client: reqwest::Client,
    kind: ModelKind,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpGateway {
    /// Build a gateway from a registry entry.
    pub fn new(id: &str, entry: &ModelEntry) -> Result<Self> {
        let base_url = entry.base_url.as_deref().ok_or_else(|| {
            DistillError::config(format!("model {id:?} has no base_url configured"))
        })?;
        let url = match entry.kind {
            ModelKind::Chat => chat_url(base_url),
            ModelKind::Completion => generate_url(base_url),
            ModelKind::Echo => {
                return Err(DistillError::config(format!(
                    "model {id:?}: echo backends have no HTTP endpoint"
                ))
                .into());
            }
        };
        Ok(Self {
            client: reqwest::Client::new(),
            kind: entry.kind,
            url,
            api_key: entry.api_key()?,
            model: entry.backend_model(id).to_owned(),
        })
    }

    fn chat_payload(&self, request: &GenerationRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        let object = payload.as_object_mut().expect("payload is an object");
        if let Some(max_tokens) = request.max_tokens {
            object.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            object.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            object.insert("top_p".into(), json!(top_p));
        }
        if let Some(top_k) = request.top_k
            && top_k > 0
        {
            object.insert("top_k".into(), json!(top_k));
        }
        payload
    }

    fn completion_payload(&self, request: &GenerationRequest) -> Value {
        // Completion backends have no message roles; the system prompt
        // is concatenated ahead of the user prompt.
        let prompt = match &request.system_prompt {
            Some(system) => format!("{system}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        };
        let mut payload = json!({ "prompt": prompt });
        let object = payload.as_object_mut().expect("payload is an object");
        if let Some(max_tokens) = request.max_tokens {
            object.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            object.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            object.insert("top_p".into(), json!(top_p));
        }
        if let Some(top_k) = request.top_k
            && top_k > 0
        {
            object.insert("top_k".into(), json!(top_k));
        }
        payload
    }
}

#[async_trait::async_trait]
impl ModelGateway for HttpGateway {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ModelError> {
        let payload = match self.kind {
            ModelKind::Chat => self.chat_payload(request),
            ModelKind::Completion => self.completion_payload(request),
            ModelKind::Echo => unreachable!("echo handled at construction"),
        };

        let mut builder = self
            .client
            .post(&self.url)
            .timeout(request.timeout)
            .json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| ModelError::Malformed(err.to_string()))?;
        match self.kind {
            ModelKind::Chat => extract_chat_content(&body),
            ModelKind::Completion => extract_completion_text(&body),
            ModelKind::Echo => unreachable!("echo handled at construction"),
        }
    }
}

/// Append the standard chat path if the base URL doesn't carry it.
fn chat_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_owned()
    } else if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// Append `/generate` if the base URL doesn't carry it.
fn generate_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/generate") {
        base.to_owned()
    } else {
        format!("{base}/generate")
    }
}

/// Errors from `send()` itself carry no HTTP status to classify.
/// Network-level failures (resets, timeouts, DNS hiccups) are treated
/// as transient.
fn classify_send_error(err: reqwest::Error) -> ModelError {
    ModelError::Transient {
        status: None,
        retry_after: None,
        message: err.to_string(),
    }
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ModelError {
    let message = snippet(body);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ModelError::Transient {
            status: Some(status.as_u16()),
            retry_after,
            message,
        }
    } else {
        ModelError::Client {
            status: status.as_u16(),
            message,
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds. The HTTP-date
/// form is rare from LLM gateways and is ignored.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Pull the assistant text out of a chat response, wrapping any
/// separate reasoning field in the `<think>` sentinel.
fn extract_chat_content(body: &Value) -> Result<String, ModelError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| ModelError::Malformed("response has no choices".into()))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let reasoning = message
        .get("reasoning_content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if reasoning.is_empty() {
        Ok(content.to_owned())
    } else {
        Ok(format!("<think>\n{reasoning}\n</think>\n\n{content}"))
    }
}

/// Pull generated text out of a completion response. Backends disagree
/// on the field name: `text`, `output`, or `outputs[0].text`.
fn extract_completion_text(body: &Value) -> Result<String, ModelError> {
    if let Some(text) = body.get("text").and_then(Value::as_str) {
        return Ok(text.to_owned());
    }
    if let Some(text) = body.get("output").and_then(Value::as_str) {
        return Ok(text.to_owned());
    }
    if let Some(text) = body.pointer("/outputs/0/text").and_then(Value::as_str) {
        return Ok(text.to_owned());
    }
    Err(ModelError::Malformed(format!(
        "no text field in completion response: {}",
        snippet(&body.to_string())
    )))
}

/// First part of a possibly huge body, for error messages.
fn snippet(body: &str) -> String {
    const LIMIT: usize = 300;
    if body.len() <= LIMIT {
        body.to_owned()
    } else {
        let mut end = LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_normalization() {
        assert_eq!(
            chat_url("http://localhost:4000"),
            "http://localhost:4000/v1/chat/completions"
        );
        assert_eq!(
            chat_url("http://localhost:4000/v1/"),
            "http://localhost:4000/v1/chat/completions"
        );
        assert_eq!(
            chat_url("http://localhost:4000/v1/chat/completions"),
            "http://localhost:4000/v1/chat/completions"
        );
        assert_eq!(
            generate_url("http://localhost:8000"),
            "http://localhost:8000/generate"
        );
        assert_eq!(
            generate_url("http://localhost:8000/generate"),
            "http://localhost:8000/generate"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, "slow down")
                .is_transient()
        );
        assert!(
            classify_status(StatusCode::BAD_GATEWAY, None, "").is_transient()
        );
        assert!(
            !classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, "bad req")
                .is_transient()
        );
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(30)),
            "",
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_chat_extraction_wraps_reasoning() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "42",
                    "reasoning_content": "six times seven"
                }
            }]
        });
        let text = extract_chat_content(&body).unwrap();
        assert_eq!(text, "<think>\nsix times seven\n</think>\n\n42");

        let plain = json!({ "choices": [{ "message": { "content": "42" } }] });
        assert_eq!(extract_chat_content(&plain).unwrap(), "42");

        let empty = json!({ "choices": [] });
        assert!(extract_chat_content(&empty).is_err());
    }

    #[test]
    fn test_completion_extraction_field_fallbacks() {
        assert_eq!(
            extract_completion_text(&json!({ "text": "a" })).unwrap(),
            "a"
        );
        assert_eq!(
            extract_completion_text(&json!({ "output": "b" })).unwrap(),
            "b"
        );
        assert_eq!(
            extract_completion_text(&json!({ "outputs": [{ "text": "c" }] })).unwrap(),
            "c"
        );
        assert!(extract_completion_text(&json!({ "nope": 1 })).is_err());
    }
}
