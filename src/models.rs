//! Static Ollama model metadata.
//!
//! Ollama clients probe `/api/version`, list `/api/tags` and inspect
//! `/api/show` before they send any chat traffic. None of this touches the
//! upstream: the advertised models come from `models` in the config.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::server::AppState;
use crate::translate::model_name::normalize_model_name;

/// Ollama version we claim; editor integrations gate features on it.
pub const OLLAMA_VERSION: &str = "0.6.4";

/// Fixed timestamp reported for every advertised model.
const MODIFIED_AT: &str = "2025-01-01T00:00:00Z";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDetails {
    pub parent_model: String,
    pub format: String,
    pub family: String,
    pub families: Vec<String>,
    pub parameter_size: String,
    pub quantization_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelTag {
    pub name: String,
    pub model: String,
    pub modified_at: String,
    pub size: u64,
    pub digest: String,
    pub details: ModelDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsResponse {
    pub models: Vec<ModelTag>,
}

/// Family is the leading alphabetic run of the base name: `glm-4.6` → `glm`.
fn family_of(name: &str) -> String {
    let base = normalize_model_name(name);
    let family: String = base
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if family.is_empty() {
        base.to_string()
    } else {
        family.to_ascii_lowercase()
    }
}

/// Stable pseudo-digest so clients can tell models apart.
fn digest_of(name: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, name.as_bytes())
        .simple()
        .to_string()
}

fn details_for(name: &str) -> ModelDetails {
    let family = family_of(name);
    ModelDetails {
        parent_model: String::new(),
        format: "remote".to_string(),
        families: vec![family.clone()],
        family,
        parameter_size: "unknown".to_string(),
        quantization_level: "unknown".to_string(),
    }
}

pub fn model_tag(name: &str) -> ModelTag {
    ModelTag {
        name: name.to_string(),
        model: name.to_string(),
        modified_at: MODIFIED_AT.to_string(),
        size: 0,
        digest: digest_of(name),
        details: details_for(name),
    }
}

pub fn tags(models: &[String]) -> TagsResponse {
    TagsResponse {
        models: models.iter().map(|m| model_tag(m)).collect(),
    }
}

/// `/api/show` body for `name`, whether or not it is advertised.
pub fn show(name: &str) -> Value {
    json!({
        "license": "",
        "modelfile": format!("FROM {name}\n"),
        "parameters": "",
        "template": "{{ .Prompt }}",
        "details": details_for(name),
        "model_info": {
            "general.architecture": family_of(name),
            "general.basename": normalize_model_name(name),
        },
        "capabilities": ["completion", "tools"],
        "modified_at": MODIFIED_AT,
    })
}

/// Accepts `{model}` or the older `{name}`.
pub fn show_request_model(body: &[u8]) -> Result<String> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::validation_with_detail("Invalid JSON body", e.to_string()))?;

    ["model", "name"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::validation("\"model\" is required"))
}

pub async fn handle_version() -> Json<Value> {
    Json(json!({ "version": OLLAMA_VERSION }))
}

pub async fn handle_tags(State(state): State<Arc<AppState>>) -> Json<TagsResponse> {
    Json(tags(&state.config.models))
}

pub async fn handle_show(body: Bytes) -> Response {
    match show_request_model(&body) {
        Ok(model) => {
            tracing::debug!(%model, "POST /api/show");
            Json(show(&model)).into_response()
        }
        Err(e) => e.into_response(),
    }
}
