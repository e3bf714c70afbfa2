//! Calls to the upstream chat-completions endpoint.

use std::sync::OnceLock;
use std::time::Duration;

use serde_json::Value;

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};
use crate::translate::types::{UpstreamCompletion, UpstreamRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_TEXT_LIMIT: usize = 500;

/// What the upstream handed back for a `stream=true` request.
#[derive(Debug)]
pub enum UpstreamStream {
    /// A live SSE (or otherwise non-JSON) body; consume with `bytes_stream()`.
    Sse(reqwest::Response),
    /// The upstream ignored `stream=true` and answered with one JSON document.
    Buffered(UpstreamCompletion),
}

#[derive(Debug)]
pub struct UpstreamDispatcher {
    client: reqwest::Client,
    config: UpstreamConfig,
    credential: OnceLock<std::result::Result<String, String>>,
}

impl UpstreamDispatcher {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: &UpstreamConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            config: config.clone(),
            credential: OnceLock::new(),
        }
    }

    /// Resolved once per process; a failure is remembered and never retried.
    pub fn credential(&self) -> Result<String> {
        self.credential
            .get_or_init(|| {
                self.config.resolve_api_key().map_err(|e| match e {
                    GatewayError::Config { message } => message,
                    other => other.to_string(),
                })
            })
            .clone()
            .map_err(GatewayError::config)
    }

    pub fn endpoint(&self) -> Result<String> {
        self.config.chat_completions_url()
    }

    /// One buffered completion.
    pub async fn complete(&self, req: &UpstreamRequest) -> Result<UpstreamCompletion> {
        let response = self.send(req).await?;
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::upstream(format!("Failed to read upstream response: {e}")))?;

        tracing::debug!(body_len = body.len(), "Upstream completion received");
        parse_completion(&body)
    }

    /// Open a streaming completion. Errors here happen before any byte reaches
    /// the client.
    pub async fn open_stream(&self, req: &UpstreamRequest) -> Result<UpstreamStream> {
        let response = self.send(req).await?;

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if !is_json {
            return Ok(UpstreamStream::Sse(response));
        }

        tracing::debug!("Upstream answered a streaming request with JSON; replaying");
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::upstream(format!("Failed to read upstream response: {e}")))?;
        parse_completion(&body).map(UpstreamStream::Buffered)
    }

    async fn send(&self, req: &UpstreamRequest) -> Result<reqwest::Response> {
        let api_key = self.credential()?;
        let url = self.endpoint()?;

        tracing::info!(%url, model = %req.model, stream = req.stream, "Dispatching upstream request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(req)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = extract_error_message(&body);
        tracing::warn!(status = status.as_u16(), %message, "Upstream returned an error");

        Err(GatewayError::upstream(format!(
            "Upstream returned status {}: {}",
            status.as_u16(),
            message
        )))
    }
}

fn parse_completion(body: &str) -> Result<UpstreamCompletion> {
    serde_json::from_str(body).map_err(|e| {
        GatewayError::upstream(format!(
            "Malformed upstream response: {e}. Body: {}",
            truncate(body, 300)
        ))
    })
}

/// Best-effort human message from an upstream error body.
pub fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.get("message"),
            value.get("error"),
        ];
        if let Some(message) = candidates
            .into_iter()
            .flatten()
            .find_map(Value::as_str)
            .filter(|m| !m.is_empty())
        {
            return message.to_string();
        }
    }

    if body.trim().is_empty() {
        return "empty response body".to_string();
    }
    truncate(body, ERROR_TEXT_LIMIT).to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
