//! Local token accounting.
//!
//! Used only when the upstream response carries no `usage` object. Counts are
//! computed on already-buffered text after the response (or stream) has been
//! fully assembled, never on the hot path.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Where the reported token counts came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    Upstream,
    Local,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub source: TokenSource,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Shared BPE-backed counter. Cloning is cheap.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::o200k_base().context("failed to load o200k tokenizer")?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    pub fn count_text(&self, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }

    /// Approximate prompt size for a chat message list: a fixed per-message
    /// overhead plus the tokenized content, with a reply primer at the end.
    pub fn count_messages(&self, messages: &[Value]) -> u64 {
        const TOKENS_PER_MESSAGE: u64 = 4;
        const REPLY_PRIMER: u64 = 3;

        let mut total = 0;
        for message in messages {
            total += TOKENS_PER_MESSAGE;
            match message.get("content") {
                Some(Value::String(text)) => total += self.count_text(text),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            total += self.count_text(text);
                        }
                    }
                }
                _ => {}
            }
            if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let name = call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let arguments = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    total += self.count_text(name) + self.count_text(arguments);
                }
            }
        }
        total + REPLY_PRIMER
    }

    /// Compute local usage for a request/completion pair.
    pub fn local_usage(&self, messages: &[Value], completion: &str) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.count_messages(messages),
            completion_tokens: self.count_text(completion),
            source: TokenSource::Local,
        }
    }
}

/// Pull an upstream `usage` object out of a response body, tolerating both
/// the OpenAI and the messages-API field names.
pub fn usage_from_body(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_u64)?;
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        source: TokenSource::Upstream,
    })
}
