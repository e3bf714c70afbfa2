//! Canonicalize inbound chat messages into the shape the upstream expects.
//!
//! Clients send a surprising variety of message arrays: bare strings, `null`
//! placeholders, structured tool-call arguments, unknown roles. Everything
//! recoverable is coerced; a message that still has no string `role` fails the
//! whole request with a 400.

use serde_json::{Map, Value};

use super::types::{ChatMessage, ContentPart, MessageContent, Role, ToolCall, ToolCallFunction};
use crate::error::{GatewayError, Result};

/// Name used when a tool call arrives without a function name.
pub const PLACEHOLDER_FUNCTION_NAME: &str = "unknown";

/// Normalize a `messages` value. Order is preserved exactly.
pub fn normalize_messages(messages: &Value) -> Result<Vec<ChatMessage>> {
    let items = messages
        .as_array()
        .ok_or_else(|| GatewayError::validation("\"messages\" must be an array"))?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| normalize_message(index, item))
        .collect()
}

fn normalize_message(index: usize, item: &Value) -> Result<ChatMessage> {
    let obj = match item {
        Value::Null => {
            return Ok(ChatMessage {
                role: Role::User,
                content: None,
                name: None,
                tool_call_id: None,
                tool_calls: None,
            })
        }
        Value::String(text) => return Ok(ChatMessage::text(Role::User, text.clone())),
        Value::Object(obj) => obj,
        _ => return Err(role_error(index)),
    };

    let role = obj
        .get("role")
        .and_then(Value::as_str)
        .map(Role::parse_lenient)
        .ok_or_else(|| role_error(index))?;

    let tool_calls = obj
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().map(normalize_tool_call).collect::<Vec<_>>());

    Ok(ChatMessage {
        role,
        content: obj.get("content").and_then(normalize_content),
        name: obj.get("name").and_then(Value::as_str).map(str::to_string),
        tool_call_id: obj
            .get("tool_call_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        tool_calls,
    })
}

fn role_error(index: usize) -> GatewayError {
    GatewayError::validation(format!("messages[{index}].role must be a string"))
}

fn normalize_content(content: &Value) -> Option<MessageContent> {
    match content {
        Value::Null => None,
        Value::String(text) => Some(MessageContent::Text(text.clone())),
        Value::Array(parts) => Some(MessageContent::Parts(
            parts.iter().map(normalize_part).collect(),
        )),
        other => Some(MessageContent::Text(other.to_string())),
    }
}

/// Shallow copy of one content part; a bare string becomes a `text` part.
fn normalize_part(part: &Value) -> ContentPart {
    match part {
        Value::Object(obj) => {
            let mut fields = obj.clone();
            let part_type = match fields.remove("type") {
                Some(Value::String(t)) => t,
                _ => "text".to_string(),
            };
            ContentPart { part_type, fields }
        }
        Value::String(text) => {
            let mut fields = Map::new();
            fields.insert("text".to_string(), Value::String(text.clone()));
            ContentPart {
                part_type: "text".to_string(),
                fields,
            }
        }
        other => {
            let mut fields = Map::new();
            fields.insert("text".to_string(), Value::String(other.to_string()));
            ContentPart {
                part_type: "text".to_string(),
                fields,
            }
        }
    }
}

/// Fill in id/type/name and force `arguments` to a string.
pub fn normalize_tool_call(call: &Value) -> ToolCall {
    let function = call.get("function");

    let id = call
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_tool_call_id);

    let name = function
        .and_then(|f| f.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or(PLACEHOLDER_FUNCTION_NAME)
        .to_string();

    ToolCall {
        id,
        call_type: "function".to_string(),
        function: ToolCallFunction {
            name,
            arguments: stringify_arguments(function.and_then(|f| f.get("arguments"))),
        },
    }
}

/// Tool-call arguments as the upstream wants them: JSON text.
pub fn stringify_arguments(arguments: Option<&Value>) -> String {
    match arguments {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_else(|_| format!("{other}")),
    }
}

pub fn generate_tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_array_messages_rejected() {
        let err = normalize_messages(&json!("not an array")).unwrap_err();
        assert_eq!(err.to_string(), "\"messages\" must be an array");

        assert!(normalize_messages(&Value::Null).is_err());
        assert!(normalize_messages(&json!({"role": "user"})).is_err());
    }

    #[test]
    fn test_order_preserved() {
        let input = json!([
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "one"},
            {"role": "assistant", "content": "two"},
            {"role": "user", "content": "one"},
        ]);

        let out = normalize_messages(&input).unwrap();
        let texts: Vec<_> = out
            .iter()
            .map(|m| match &m.content {
                Some(MessageContent::Text(t)) => t.as_str(),
                _ => "",
            })
            .collect();

        assert_eq!(texts, vec!["be brief", "one", "two", "one"]);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[2].role, Role::Assistant);
    }

    #[test]
    fn test_null_and_string_elements_coerced() {
        let out = normalize_messages(&json!([null, "hello"])).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::User);
        assert!(out[0].content.is_none());
        assert_eq!(out[1].content, Some(MessageContent::Text("hello".to_string())));
    }

    #[test]
    fn test_missing_or_non_string_role_fails_request() {
        let err = normalize_messages(&json!([{"role": "user"}, {"content": "x"}])).unwrap_err();
        assert_eq!(err.to_string(), "messages[1].role must be a string");

        let err = normalize_messages(&json!([{"role": 7, "content": "x"}])).unwrap_err();
        assert_eq!(err.to_string(), "messages[0].role must be a string");

        assert!(normalize_messages(&json!([42])).is_err());
    }

    #[test]
    fn test_unknown_role_becomes_user() {
        let out = normalize_messages(&json!([{"role": "developer", "content": "x"}])).unwrap();
        assert_eq!(out[0].role, Role::User);
    }

    #[test]
    fn test_content_parts_shallow_copied() {
        let out = normalize_messages(&json!([{
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this?"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png", "detail": "low"}}
            ]
        }]))
        .unwrap();

        let Some(MessageContent::Parts(parts)) = &out[0].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_type, "text");
        assert_eq!(parts[1].part_type, "image_url");
        assert_eq!(parts[1].fields["image_url"]["detail"], "low");
    }

    #[test]
    fn test_tool_calls_normalized() {
        let out = normalize_messages(&json!([{
            "role": "assistant",
            "content": null,
            "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "get_weather", "arguments": {"city": "Paris"}}},
                {"function": {"arguments": "{\"q\":1}"}},
                {"type": "something_else", "function": {"name": "noop"}}
            ]
        }]))
        .unwrap();

        let calls = out[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 3);

        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, r#"{"city":"Paris"}"#);

        assert!(calls[1].id.starts_with("call_"));
        assert_eq!(calls[1].function.name, PLACEHOLDER_FUNCTION_NAME);
        assert_eq!(calls[1].function.arguments, r#"{"q":1}"#);

        assert_eq!(calls[2].call_type, "function");
        assert_eq!(calls[2].function.arguments, "{}");
    }

    #[test]
    fn test_tool_result_message_keeps_id() {
        let out = normalize_messages(&json!([
            {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
        ]))
        .unwrap();

        assert_eq!(out[0].role, Role::Tool);
        assert_eq!(out[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_tool_call_id(), generate_tool_call_id());
    }
}
