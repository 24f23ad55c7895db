//! Incremental SSE decoding for the streaming passthrough.
//!
//! The passthrough forwards upstream bytes unchanged; this module only
//! *observes* them, reconstructing the assistant message for logging and
//! token accounting. Chunk boundaries do not align with line boundaries, so
//! decoding is buffered exactly the way the upstream frames arrive.

use std::collections::BTreeMap;

use serde_json::{json, Value};

pub const SSE_DONE: &str = "[DONE]";

/// Splits an arbitrary byte stream into complete `data:` payloads.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns the `data:` payloads completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim().to_string();
            self.buffer.drain(..=newline);
            if let Some(payload) = line.strip_prefix("data:") {
                payloads.push(payload.trim_start().to_string());
            }
        }
        payloads
    }
}

#[derive(Debug, Default, Clone)]
struct ToolCallDraft {
    id: String,
    kind: String,
    name: String,
    arguments: String,
}

/// Reconstructs the assistant message from streamed deltas.
///
/// The text buffer is bounded: past `max_bytes` the *logged* text is
/// truncated while the client keeps receiving the untouched stream.
pub struct DeltaAggregator {
    max_bytes: usize,
    content: String,
    truncated: bool,
    tool_calls: BTreeMap<u64, ToolCallDraft>,
    finish_reason: Option<String>,
    usage: Option<Value>,
    saw_done: bool,
}

impl DeltaAggregator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            content: String::new(),
            truncated: false,
            tool_calls: BTreeMap::new(),
            finish_reason: None,
            usage: None,
            saw_done: false,
        }
    }

    /// Absorb one `data:` payload. Returns `true` once the terminal `[DONE]`
    /// marker has been seen.
    pub fn absorb(&mut self, payload: &str) -> bool {
        if payload == SSE_DONE {
            self.saw_done = true;
            return true;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return false;
        };
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(usage.clone());
        }
        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return false;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        let Some(delta) = choice.get("delta") else {
            return false;
        };
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if self.content.len() + text.len() <= self.max_bytes {
                self.content.push_str(text);
            } else {
                self.truncated = true;
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let draft = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    if !id.is_empty() {
                        draft.id = id.to_string();
                    }
                }
                if let Some(kind) = call.get("type").and_then(Value::as_str) {
                    draft.kind = kind.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        draft.name.push_str(name);
                    }
                    if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                        draft.arguments.push_str(arguments);
                    }
                }
            }
        }
        false
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn usage(&self) -> Option<&Value> {
        self.usage.as_ref()
    }

    /// True when the stream produced neither text nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }

    pub fn finish_reason(&self) -> &str {
        self.finish_reason.as_deref().unwrap_or("stop")
    }

    /// The reconstructed assistant message, for the request log.
    pub fn to_message(&self) -> Value {
        let mut message = json!({
            "role": "assistant",
            "content": if self.content.is_empty() { Value::Null } else { Value::String(self.content.clone()) },
        });
        if !self.tool_calls.is_empty() {
            let calls: Vec<Value> = self
                .tool_calls
                .values()
                .map(|draft| {
                    json!({
                        "id": draft.id,
                        "type": if draft.kind.is_empty() { "function" } else { draft.kind.as_str() },
                        "function": {"name": draft.name, "arguments": draft.arguments},
                    })
                })
                .collect();
            message["tool_calls"] = Value::Array(calls);
        }
        message
    }
}
