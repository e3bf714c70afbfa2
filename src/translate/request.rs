//! Turn an inbound OpenAI-style request body into the upstream request.
//!
//! Validation happens here, before any upstream traffic: malformed JSON, a
//! missing or non-string `model`, and bad `messages` are all client errors.
//! Sampling and tool fields are forwarded verbatim.

use serde_json::Value;

use super::messages::normalize_messages;
use super::model_name::ModelMapper;
use super::types::{ChatMessage, ClientApi, Role, UpstreamRequest};
use crate::error::{GatewayError, Result};

/// A validated inbound request, ready for dispatch.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Exactly what the client asked for; echoed back in every response.
    pub requested_model: String,
    pub stream: bool,
    pub upstream: UpstreamRequest,
}

/// Fields copied to the upstream untouched when present.
const PASSTHROUGH_FIELDS: &[&str] = &[
    "temperature",
    "top_p",
    "max_tokens",
    "tools",
    "tool_choice",
    "response_format",
    "user",
    "metadata",
    "stop",
    "seed",
    "presence_penalty",
    "frequency_penalty",
];

pub fn parse_body(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::validation_with_detail("Invalid JSON body", e.to_string()))
}

pub fn build_upstream_request(
    body: &Value,
    api: ClientApi,
    mapper: &ModelMapper,
) -> Result<InboundRequest> {
    let obj = body
        .as_object()
        .ok_or_else(|| GatewayError::validation("Request body must be a JSON object"))?;

    let requested_model = match obj.get("model") {
        None | Some(Value::Null) => return Err(GatewayError::validation("\"model\" is required")),
        Some(Value::String(model)) => model.clone(),
        Some(_) => return Err(GatewayError::validation("\"model\" must be a string")),
    };

    let messages = match api {
        ClientApi::Responses if !obj.contains_key("messages") => responses_input_messages(body)?,
        _ => normalize_messages(obj.get("messages").unwrap_or(&Value::Null))?,
    };

    let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let target = mapper.resolve_target(&requested_model);

    let mut upstream = UpstreamRequest::new(target, messages, stream);
    for field in PASSTHROUGH_FIELDS {
        if let Some(value) = obj.get(*field).filter(|v| !v.is_null()) {
            set_passthrough(&mut upstream, field, value.clone());
        }
    }

    if api == ClientApi::Responses && upstream.max_tokens.is_none() {
        upstream.max_tokens = obj.get("max_output_tokens").filter(|v| !v.is_null()).cloned();
    }

    Ok(InboundRequest {
        requested_model,
        stream,
        upstream,
    })
}

fn set_passthrough(req: &mut UpstreamRequest, field: &str, value: Value) {
    let slot = match field {
        "temperature" => &mut req.temperature,
        "top_p" => &mut req.top_p,
        "max_tokens" => &mut req.max_tokens,
        "tools" => &mut req.tools,
        "tool_choice" => &mut req.tool_choice,
        "response_format" => &mut req.response_format,
        "user" => &mut req.user,
        "metadata" => &mut req.metadata,
        "stop" => &mut req.stop,
        "seed" => &mut req.seed,
        "presence_penalty" => &mut req.presence_penalty,
        "frequency_penalty" => &mut req.frequency_penalty,
        _ => return,
    };
    *slot = Some(value);
}

/// Responses-API bodies carry `input` (+ optional `instructions`) instead of `messages`.
fn responses_input_messages(body: &Value) -> Result<Vec<ChatMessage>> {
    let mut messages = Vec::new();

    if let Some(instructions) = body.get("instructions").and_then(Value::as_str) {
        messages.push(ChatMessage::text(Role::System, instructions));
    }

    match body.get("input") {
        Some(Value::String(text)) => messages.push(ChatMessage::text(Role::User, text.clone())),
        Some(input @ Value::Array(_)) => messages.extend(normalize_messages(input)?),
        _ => return Err(GatewayError::validation("\"messages\" must be an array")),
    }

    Ok(messages)
}
