use super::messages::{generate_tool_call_id, stringify_arguments, PLACEHOLDER_FUNCTION_NAME};
use super::types::{
    AssistantMessage, ChatCompletionResponse, ClientApi, CompletionChoice, OutputText,
    ResponseOutput, ResponsesResponse, Role, ToolCall, ToolCallFunction, UpstreamChoice,
    UpstreamCompletion, UpstreamContent, UpstreamMessage, UpstreamToolCall,
};

/// Where a given upstream choice keeps its text. Checked in declaration order.
#[derive(Debug, Clone, Copy)]
pub enum ChoiceShape<'a> {
    Message(&'a UpstreamMessage),
    Delta(&'a UpstreamMessage),
    Text(&'a str),
    Content(&'a UpstreamContent),
    Contents(&'a [UpstreamContent]),
    Empty,
}

impl UpstreamChoice {
    pub fn shape(&self) -> ChoiceShape<'_> {
        if let Some(ref message) = self.message {
            ChoiceShape::Message(message)
        } else if let Some(ref delta) = self.delta {
            ChoiceShape::Delta(delta)
        } else if let Some(ref text) = self.text {
            ChoiceShape::Text(text)
        } else if let Some(ref content) = self.content {
            ChoiceShape::Content(content)
        } else if let Some(ref contents) = self.contents {
            ChoiceShape::Contents(contents)
        } else {
            ChoiceShape::Empty
        }
    }
}

/// The single place upstream text is pulled out of a choice.
pub fn extract_content(shape: ChoiceShape<'_>) -> String {
    match shape {
        ChoiceShape::Message(msg) | ChoiceShape::Delta(msg) => msg
            .content
            .as_ref()
            .map(UpstreamContent::to_text)
            .unwrap_or_default(),
        ChoiceShape::Text(text) => text.to_string(),
        ChoiceShape::Content(content) => content.to_text(),
        ChoiceShape::Contents(contents) => contents.iter().map(UpstreamContent::to_text).collect(),
        ChoiceShape::Empty => String::new(),
    }
}

fn shape_message(shape: ChoiceShape<'_>) -> Option<&UpstreamMessage> {
    match shape {
        ChoiceShape::Message(msg) | ChoiceShape::Delta(msg) => Some(msg),
        _ => None,
    }
}

pub fn complete_tool_call(call: &UpstreamToolCall) -> ToolCall {
    let function = call.function.as_ref();
    ToolCall {
        id: call
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_tool_call_id),
        call_type: "function".to_string(),
        function: ToolCallFunction {
            name: function
                .and_then(|f| f.name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| PLACEHOLDER_FUNCTION_NAME.to_string()),
            arguments: stringify_arguments(function.and_then(|f| f.arguments.as_ref())),
        },
    }
}

/// Everything the client needs from a buffered upstream completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionParts {
    pub id: Option<String>,
    pub created: Option<i64>,
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<serde_json::Value>,
}

impl CompletionParts {
    pub fn from_upstream(resp: &UpstreamCompletion) -> Self {
        let choice = resp.choices.first();
        let shape = choice.map_or(ChoiceShape::Empty, UpstreamChoice::shape);
        let message = shape_message(shape);

        Self {
            id: resp.id.clone(),
            created: resp.created,
            content: extract_content(shape),
            reasoning: message
                .and_then(|m| m.reasoning_content.clone())
                .filter(|r| !r.is_empty()),
            tool_calls: message
                .and_then(|m| m.tool_calls.as_ref())
                .map(|calls| calls.iter().map(complete_tool_call).collect())
                .unwrap_or_default(),
            finish_reason: choice.and_then(|c| c.finish_reason.clone()),
            usage: resp.usage.clone(),
        }
    }

    pub fn finish_reason_or_default(&self) -> String {
        self.finish_reason.clone().unwrap_or_else(|| {
            if self.tool_calls.is_empty() {
                "stop".to_string()
            } else {
                "tool_calls".to_string()
            }
        })
    }

    fn tool_calls_opt(&self) -> Option<Vec<ToolCall>> {
        if self.tool_calls.is_empty() {
            None
        } else {
            Some(self.tool_calls.clone())
        }
    }
}

pub fn generate_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Build the `/v1/chat/completions` body. `model` is what the client requested.
pub fn to_chat_completion(parts: &CompletionParts, model: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: parts.id.clone().unwrap_or_else(generate_completion_id),
        object: "chat.completion".to_string(),
        created: parts.created.unwrap_or_else(unix_now),
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: Role::Assistant,
                content: parts.content.clone(),
                reasoning_content: parts.reasoning.clone(),
                tool_calls: parts.tool_calls_opt(),
            },
            finish_reason: Some(parts.finish_reason_or_default()),
        }],
        usage: parts.usage.clone(),
    }
}

/// Build the `/v1/responses` body. `model` is what the client requested.
pub fn to_responses(parts: &CompletionParts, model: &str) -> ResponsesResponse {
    ResponsesResponse {
        id: parts.id.clone().unwrap_or_else(generate_completion_id),
        object: "response".to_string(),
        created: parts.created.unwrap_or_else(unix_now),
        model: model.to_string(),
        outputs: vec![ResponseOutput {
            index: 0,
            role: Role::Assistant,
            content: vec![OutputText {
                content_type: "text".to_string(),
                text: parts.content.clone(),
            }],
            tool_calls: parts.tool_calls_opt(),
            finish_reason: Some(parts.finish_reason_or_default()),
        }],
        usage: parts.usage.clone(),
    }
}

pub fn render_completion(
    resp: &UpstreamCompletion,
    api: ClientApi,
    model: &str,
) -> serde_json::Value {
    let parts = CompletionParts::from_upstream(resp);
    let rendered = match api {
        ClientApi::ChatCompletions => serde_json::to_value(to_chat_completion(&parts, model)),
        ClientApi::Responses => serde_json::to_value(to_responses(&parts, model)),
    };
    rendered.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> UpstreamCompletion {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_simple_text_response_echoes_model() {
        let upstream = parse(json!({
            "id": "chatcmpl-abc",
            "created": 1700000000,
            "model": "glm-4.6",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello there!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        }));

        let body = render_completion(&upstream, ClientApi::ChatCompletions, "glm-4.6:latest");

        assert_eq!(body["id"], "chatcmpl-abc");
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "glm-4.6:latest");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello there!");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 8);
    }

    #[test]
    fn test_content_shapes() {
        let cases = [
            json!({"choices": [{"message": {"content": "m"}}]}),
            json!({"choices": [{"delta": {"content": "m"}}]}),
            json!({"choices": [{"text": "m"}]}),
            json!({"choices": [{"content": "m"}]}),
            json!({"choices": [{"contents": ["m"]}]}),
            json!({"choices": [{"message": {"content": [{"type": "text", "text": "m"}]}}]}),
        ];

        for case in cases {
            let parts = CompletionParts::from_upstream(&parse(case.clone()));
            assert_eq!(parts.content, "m", "failed for {case}");
        }
    }

    #[test]
    fn test_unknown_shape_is_empty() {
        let parts = CompletionParts::from_upstream(&parse(json!({"choices": [{"weird": 1}]})));
        assert_eq!(parts.content, "");

        let parts = CompletionParts::from_upstream(&parse(json!({"choices": []})));
        assert_eq!(parts.content, "");
        assert!(parts.tool_calls.is_empty());
    }

    #[test]
    fn test_tool_call_response() {
        let upstream = parse(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_abc", "type": "function", "function": {"name": "get_weather", "arguments": {"city": "London"}}}]
                }
            }]
        }));

        let body = render_completion(&upstream, ClientApi::ChatCompletions, "glm-4.6");
        let call = &body["choices"][0]["message"]["tool_calls"][0];

        assert_eq!(call["id"], "call_abc");
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["arguments"], r#"{"city":"London"}"#);
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    }

    #[test]
    fn test_responses_shape() {
        let upstream = parse(json!({
            "choices": [{"message": {"content": "Bonjour"}, "finish_reason": "stop"}]
        }));

        let body = render_completion(&upstream, ClientApi::Responses, "glm-4.6:latest");

        assert_eq!(body["object"], "response");
        assert_eq!(body["model"], "glm-4.6:latest");
        assert_eq!(body["outputs"][0]["content"][0]["type"], "text");
        assert_eq!(body["outputs"][0]["content"][0]["text"], "Bonjour");
        assert!(body.get("choices").is_none());
    }
}
