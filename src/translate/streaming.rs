//! State machine that re-frames an upstream SSE byte stream into the client's
//! streaming protocol.
//!
//! The [`StreamTranscoder`] takes raw bytes as they come off the wire, reassembles
//! `data:` lines, and emits [`ClientFrame`]s in the order OpenAI-style clients
//! depend on:
//!
//! 1. exactly one role announcement (`delta: {role: "assistant"}`),
//! 2. content / reasoning deltas and, per tool call, a header frame (id, name,
//!    empty arguments) strictly before that call's argument fragments,
//! 3. one finish frame carrying the finish reason and upstream usage,
//! 4. exactly one `data: [DONE]` sentinel, written by [`StreamTranscoder::finish`].
//!
//! Every client frame reuses the `id`/`created` pinned from the first upstream
//! frame and echoes the model name the client asked for.

use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};

use super::chunk::{chunk_text, TEXT_CHUNK_BYTES, TOOL_ARGUMENT_CHUNK_BYTES};
use super::messages::{generate_tool_call_id, PLACEHOLDER_FUNCTION_NAME};
use super::response::{generate_completion_id, unix_now, CompletionParts};
use super::types::{ClientApi, UpstreamChunk, UpstreamCompletion, UpstreamToolCall};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderState {
    AwaitingRole,
    StreamingContent,
    StreamingToolCall,
    Finished,
}

/// What a single client frame carries.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameDelta {
    Role,
    Content(String),
    Reasoning(String),
    ToolCallHeader { index: u64, id: String, name: String },
    ToolCallArguments { index: u64, fragment: String },
    Finish { reason: String, usage: Option<Value> },
    /// Usage reported by the upstream after its finish frame.
    Usage(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Data(Value),
    Done,
}

impl ClientFrame {
    /// Encode as one SSE event: `data: <payload>\n\n`.
    pub fn to_sse(&self) -> Bytes {
        match self {
            Self::Data(value) => Bytes::from(format!("data: {value}\n\n")),
            Self::Done => Bytes::from(format!("data: {DONE_SENTINEL}\n\n")),
        }
    }

    pub fn json(&self) -> Option<&Value> {
        match self {
            Self::Data(value) => Some(value),
            Self::Done => None,
        }
    }
}

#[derive(Debug)]
pub struct StreamTranscoder {
    api: ClientApi,
    model: String,
    id: Option<String>,
    created: Option<i64>,
    state: TranscoderState,
    line_buffer: BytesMut,
    announced_tool_calls: BTreeSet<u64>,
    pending_usage: Option<Value>,
    usage_forwarded: bool,
    done: bool,
}

impl StreamTranscoder {
    /// `model` is the client's requested model string, echoed in every frame.
    pub fn new(api: ClientApi, model: impl Into<String>) -> Self {
        Self {
            api,
            model: model.into(),
            id: None,
            created: None,
            state: TranscoderState::AwaitingRole,
            line_buffer: BytesMut::new(),
            announced_tool_calls: BTreeSet::new(),
            pending_usage: None,
            usage_forwarded: false,
            done: false,
        }
    }

    pub fn state(&self) -> TranscoderState {
        self.state
    }

    /// Feed raw upstream bytes. Only complete lines are processed; a trailing
    /// partial line stays buffered until the next call.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<ClientFrame> {
        self.line_buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(pos) = self.line_buffer.iter().position(|b| *b == b'\n') {
            let line = self.line_buffer.split_to(pos + 1);
            self.process_line(&line[..pos], &mut frames);
        }
        frames
    }

    /// Upstream ended (cleanly or not). Flushes an unterminated last line and
    /// writes the `[DONE]` sentinel exactly once.
    pub fn finish(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }

        if !self.line_buffer.is_empty() {
            let rest = self.line_buffer.split();
            self.process_line(&rest, &mut frames);
        }

        frames.push(ClientFrame::Done);
        self.done = true;
        frames
    }

    fn process_line(&mut self, raw: &[u8], frames: &mut Vec<ClientFrame>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);

        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == DONE_SENTINEL {
            return;
        }

        match serde_json::from_str::<UpstreamChunk>(payload) {
            Ok(chunk) => frames.extend(self.process_chunk(&chunk)),
            Err(e) => {
                tracing::debug!(error = %e, line = %truncate(payload, 200), "Dropping unparseable upstream frame");
            }
        }
    }

    /// Process one parsed upstream frame.
    pub fn process_chunk(&mut self, chunk: &UpstreamChunk) -> Vec<ClientFrame> {
        self.pin_baseline(chunk.id.as_deref(), chunk.created);

        let mut frames = Vec::new();

        if self.state == TranscoderState::Finished {
            if let Some(ref usage) = chunk.usage {
                if !self.usage_forwarded {
                    self.usage_forwarded = true;
                    frames.push(self.render(FrameDelta::Usage(usage.clone())));
                }
            }
            return frames;
        }

        let Some(choice) = chunk.choices.first() else {
            if chunk.usage.is_some() {
                self.pending_usage = chunk.usage.clone();
            }
            return frames;
        };

        let delta = choice.delta.as_ref().or(choice.message.as_ref());

        if let Some(reasoning) = delta
            .and_then(|d| d.reasoning_content.as_deref())
            .filter(|r| !r.is_empty())
        {
            self.announce_role(&mut frames);
            for piece in chunk_text(reasoning, TEXT_CHUNK_BYTES) {
                frames.push(self.render(FrameDelta::Reasoning(piece.to_string())));
            }
        }

        let content = delta
            .and_then(|d| d.content.as_ref())
            .map(|c| c.to_text())
            .unwrap_or_default();
        if !content.is_empty() {
            self.emit_content(&content, &mut frames);
        }

        if let Some(tool_calls) = delta.and_then(|d| d.tool_calls.as_ref()) {
            for (position, call) in tool_calls.iter().enumerate() {
                self.emit_tool_call_delta(position as u64, call, &mut frames);
            }
        }

        if let Some(ref reason) = choice.finish_reason {
            let usage = chunk.usage.clone().or_else(|| self.pending_usage.take());
            self.emit_finish(reason.clone(), usage, &mut frames);
        }

        frames
    }

    /// Replay a buffered upstream completion as a frame sequence, for upstreams
    /// that answer a streaming request with a single JSON document.
    pub fn replay_completion(&mut self, resp: &UpstreamCompletion) -> Vec<ClientFrame> {
        let parts = CompletionParts::from_upstream(resp);
        self.pin_baseline(parts.id.as_deref(), parts.created);

        let mut frames = Vec::new();
        if self.state == TranscoderState::Finished {
            return frames;
        }

        self.announce_role(&mut frames);

        if let Some(ref reasoning) = parts.reasoning {
            for piece in chunk_text(reasoning, TEXT_CHUNK_BYTES) {
                frames.push(self.render(FrameDelta::Reasoning(piece.to_string())));
            }
        }

        if !parts.content.is_empty() {
            self.emit_content(&parts.content, &mut frames);
        }

        for (index, call) in parts.tool_calls.iter().enumerate() {
            let index = index as u64;
            self.state = TranscoderState::StreamingToolCall;
            self.announced_tool_calls.insert(index);
            frames.push(self.render(FrameDelta::ToolCallHeader {
                index,
                id: call.id.clone(),
                name: call.function.name.clone(),
            }));
            self.emit_arguments(index, &call.function.arguments, &mut frames);
        }

        self.emit_finish(parts.finish_reason_or_default(), parts.usage.clone(), &mut frames);

        frames
    }

    fn pin_baseline(&mut self, id: Option<&str>, created: Option<i64>) {
        if self.id.is_none() {
            self.id = Some(
                id.filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(generate_completion_id),
            );
            self.created = Some(created.unwrap_or_else(unix_now));
        }
    }

    fn announce_role(&mut self, frames: &mut Vec<ClientFrame>) {
        if self.state == TranscoderState::AwaitingRole {
            frames.push(self.render(FrameDelta::Role));
            self.state = TranscoderState::StreamingContent;
        }
    }

    fn emit_content(&mut self, content: &str, frames: &mut Vec<ClientFrame>) {
        self.announce_role(frames);
        self.state = TranscoderState::StreamingContent;
        for piece in chunk_text(content, TEXT_CHUNK_BYTES) {
            frames.push(self.render(FrameDelta::Content(piece.to_string())));
        }
    }

    fn emit_tool_call_delta(
        &mut self,
        position: u64,
        call: &UpstreamToolCall,
        frames: &mut Vec<ClientFrame>,
    ) {
        self.announce_role(frames);
        self.state = TranscoderState::StreamingToolCall;

        let index = call.index.unwrap_or(position);
        let function = call.function.as_ref();

        if self.announced_tool_calls.insert(index) {
            let id = call
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_tool_call_id);
            let name = function
                .and_then(|f| f.name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| PLACEHOLDER_FUNCTION_NAME.to_string());
            frames.push(self.render(FrameDelta::ToolCallHeader { index, id, name }));
        }

        let fragment = match function.and_then(|f| f.arguments.as_ref()) {
            None | Some(Value::Null) => return,
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        self.emit_arguments(index, &fragment, frames);
    }

    fn emit_arguments(&mut self, index: u64, arguments: &str, frames: &mut Vec<ClientFrame>) {
        if arguments.is_empty() {
            return;
        }
        for piece in chunk_text(arguments, TOOL_ARGUMENT_CHUNK_BYTES) {
            frames.push(self.render(FrameDelta::ToolCallArguments {
                index,
                fragment: piece.to_string(),
            }));
        }
    }

    fn emit_finish(&mut self, reason: String, usage: Option<Value>, frames: &mut Vec<ClientFrame>) {
        self.announce_role(frames);
        if usage.is_some() {
            self.usage_forwarded = true;
        }
        frames.push(self.render(FrameDelta::Finish { reason, usage }));
        self.state = TranscoderState::Finished;
    }

    fn render(&self, delta: FrameDelta) -> ClientFrame {
        let id = self.id.clone().unwrap_or_default();
        let created = self.created.unwrap_or_default();

        let (object, list_key) = match self.api {
            ClientApi::ChatCompletions => ("chat.completion.chunk", "choices"),
            ClientApi::Responses => ("response.chunk", "outputs"),
        };

        let mut frame = json!({
            "id": id,
            "object": object,
            "created": created,
            "model": self.model,
        });

        let (entries, usage) = match delta {
            FrameDelta::Usage(usage) => (json!([]), Some(usage)),
            FrameDelta::Finish { reason, usage } => (
                json!([{ "index": 0, "delta": {}, "finish_reason": reason }]),
                usage,
            ),
            other => (
                json!([{ "index": 0, "delta": self.delta_body(other), "finish_reason": null }]),
                None,
            ),
        };

        frame[list_key] = entries;
        if let Some(usage) = usage {
            frame["usage"] = usage;
        }
        ClientFrame::Data(frame)
    }

    fn delta_body(&self, delta: FrameDelta) -> Value {
        match delta {
            FrameDelta::Role => json!({ "role": "assistant" }),
            FrameDelta::Content(text) => match self.api {
                ClientApi::ChatCompletions => json!({ "content": text }),
                ClientApi::Responses => json!({ "content": { "type": "text", "text": text } }),
            },
            FrameDelta::Reasoning(text) => json!({ "reasoning_content": text }),
            FrameDelta::ToolCallHeader { index, id, name } => json!({
                "tool_calls": [{
                    "index": index,
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": "" }
                }]
            }),
            FrameDelta::ToolCallArguments { index, fragment } => json!({
                "tool_calls": [{ "index": index, "function": { "arguments": fragment } }]
            }),
            FrameDelta::Finish { .. } | FrameDelta::Usage(_) => json!({}),
        }
    }
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
