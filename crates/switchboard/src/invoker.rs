//! Single model attempt against an upstream endpoint.
//!
//! Outcomes are values, not exceptions: every attempt resolves to
//! `AttemptOutcome::Success` or `AttemptOutcome::Failure { kind, retryable }`
//! and the orchestrator's loop stays explicit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{AppConfig, Protocol, ProviderEndpoint, Tier};
use crate::error::FailureKind;
use crate::http::HttpClientPool;
use crate::params;
use crate::providers::ModelRef;
use crate::tokens::{usage_from_body, TokenUsage};

/// Cap on how much of an upstream error body is drained and logged.
const MAX_ERROR_BODY: usize = 64 * 1024;

/// How much of an error body ends up in the failure reason.
const REASON_PREVIEW: usize = 200;

pub enum UpstreamReply {
    /// Fully parsed JSON body.
    Buffered(Value),
    /// Live SSE response; the caller owns the passthrough.
    Streaming(reqwest::Response),
}

pub struct AttemptSuccess {
    pub reply: UpstreamReply,
    /// Choice text for logging; empty until a stream is reconstructed.
    pub assistant_text: String,
    /// Upstream-reported usage, if the body carried one.
    pub usage: Option<TokenUsage>,
    pub connect_ms: u64,
    pub total_ms: u64,
}

pub struct AttemptFailure {
    pub kind: FailureKind,
    pub reason: String,
    pub status: Option<StatusCode>,
    /// Raw upstream error payload, for verbatim passthrough.
    pub body: Option<Value>,
    pub retryable: bool,
    pub elapsed_ms: u64,
}

pub enum AttemptOutcome {
    Success(AttemptSuccess),
    Failure(AttemptFailure),
}

pub struct Invoker {
    clients: Arc<HttpClientPool>,
}

impl Invoker {
    pub fn new(clients: Arc<HttpClientPool>) -> Self {
        Self { clients }
    }

    /// Perform one attempt. The target must already be resolved; composing
    /// the body, firing the request, and classifying the outcome happen here.
    pub async fn attempt(
        &self,
        config: &AppConfig,
        target: &ModelRef,
        endpoint: &ProviderEndpoint,
        client_body: &Map<String, Value>,
        client_streaming: bool,
        tier: Tier,
    ) -> AttemptOutcome {
        let started = Instant::now();
        let body = params::compose(config, client_body, &target.model, endpoint.protocol);
        let upstream_streaming = client_streaming && endpoint.protocol.allows_streaming();

        let connect = Duration::from_millis(*config.timeouts.connect.get(tier));
        let generation = Duration::from_millis(*config.timeouts.generation.get(tier));

        let url = format!(
            "{}{}",
            endpoint.base_url.trim_end_matches('/'),
            endpoint.protocol.path()
        );
        debug!(model = %target, %url, streaming = upstream_streaming, "upstream attempt");

        let request = self
            .clients
            .get(endpoint.verify_ssl)
            .post(url)
            .bearer_auth(&endpoint.api_key)
            .json(&Value::Object(body));

        // Phase one: everything up to the response head.
        let response = match tokio::time::timeout(connect, request.send()).await {
            Err(_) => {
                return fail(
                    FailureKind::TimeoutConnect,
                    format!("no response head within {}ms", connect.as_millis()),
                    None,
                    None,
                    true,
                    started,
                );
            }
            Ok(Err(e)) => {
                let kind = if e.is_timeout() || e.is_connect() {
                    FailureKind::TimeoutConnect
                } else {
                    FailureKind::Transport
                };
                return fail(kind, e.to_string(), None, None, true, started);
            }
            Ok(Ok(response)) => response,
        };
        let connect_ms = started.elapsed().as_millis() as u64;

        let status = response.status();
        if !status.is_success() {
            return self
                .classify_error_status(config, response, generation, started)
                .await;
        }

        if upstream_streaming {
            return AttemptOutcome::Success(AttemptSuccess {
                reply: UpstreamReply::Streaming(response),
                assistant_text: String::new(),
                usage: None,
                connect_ms,
                total_ms: started.elapsed().as_millis() as u64,
            });
        }

        // Phase two: the whole body read runs on the generation budget.
        let raw = match tokio::time::timeout(generation, response.bytes()).await {
            Err(_) => {
                return fail(
                    FailureKind::TimeoutGeneration,
                    format!("body not complete within {}ms", generation.as_millis()),
                    Some(status),
                    None,
                    true,
                    started,
                );
            }
            Ok(Err(e)) => {
                return fail(
                    FailureKind::Transport,
                    format!("body read failed: {e}"),
                    Some(status),
                    None,
                    true,
                    started,
                );
            }
            Ok(Ok(raw)) => raw,
        };

        let parsed: Value = match serde_json::from_slice(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                return fail(
                    FailureKind::Transport,
                    format!("unparseable 2xx body: {e}"),
                    Some(status),
                    None,
                    true,
                    started,
                );
            }
        };

        let (text, has_tool_calls) = extract_completion(endpoint.protocol, &parsed);
        let conditions = &config.retries.conditions;

        if conditions.retry_on_empty && text.trim().is_empty() && !has_tool_calls {
            return fail(
                FailureKind::EmptyResponse,
                "empty completion".to_string(),
                Some(status),
                Some(parsed),
                true,
                started,
            );
        }

        let body_text = String::from_utf8_lossy(&raw);
        if let Some(keyword) = conditions.matches_keyword(&body_text) {
            return fail(
                FailureKind::BodyKeyword,
                format!("body matched retry keyword '{keyword}'"),
                Some(status),
                Some(parsed),
                true,
                started,
            );
        }

        let usage = usage_from_body(&parsed);
        AttemptOutcome::Success(AttemptSuccess {
            reply: UpstreamReply::Buffered(parsed),
            assistant_text: text,
            usage,
            connect_ms,
            total_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn classify_error_status(
        &self,
        config: &AppConfig,
        response: reqwest::Response,
        generation: Duration,
        started: Instant,
    ) -> AttemptOutcome {
        let status = response.status();
        let kind = FailureKind::from_status(status);

        // Bounded drain; a hung error body must not eat the budget.
        let text = match tokio::time::timeout(generation, response.bytes()).await {
            Ok(Ok(raw)) => {
                let end = raw.len().min(MAX_ERROR_BODY);
                String::from_utf8_lossy(&raw[..end]).to_string()
            }
            _ => String::new(),
        };

        let conditions = &config.retries.conditions;
        let keyword = conditions.matches_keyword(&text);
        let retryable =
            kind.is_retryable() || conditions.matches_status(status.as_u16()) || keyword.is_some();

        let preview: String = text.chars().take(REASON_PREVIEW).collect();
        let mut reason = format!("HTTP {}: {preview}", status.as_u16());
        if let Some(keyword) = keyword {
            reason.push_str(&format!(" (matched keyword '{keyword}')"));
        }

        let body = if text.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(&text)
                    .unwrap_or_else(|_| Value::String(text.clone())),
            )
        };

        fail(kind, reason, Some(status), body, retryable, started)
    }
}

fn fail(
    kind: FailureKind,
    reason: String,
    status: Option<StatusCode>,
    body: Option<Value>,
    retryable: bool,
    started: Instant,
) -> AttemptOutcome {
    AttemptOutcome::Failure(AttemptFailure {
        kind,
        reason,
        status,
        body,
        retryable,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Pull the assistant text (and whether tool/function calls are present) out
/// of a buffered 2xx body, per protocol flavor.
fn extract_completion(protocol: Protocol, body: &Value) -> (String, bool) {
    match protocol {
        Protocol::OpenAi => {
            let message = body.pointer("/choices/0/message");
            let text = message
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let has_calls = message
                .and_then(|m| m.get("tool_calls"))
                .and_then(Value::as_array)
                .is_some_and(|calls| !calls.is_empty());
            (text, has_calls)
        }
        Protocol::V1Messages => {
            let blocks = body.get("content").and_then(Value::as_array);
            let text = blocks
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            let has_calls = blocks.is_some_and(|blocks| {
                blocks
                    .iter()
                    .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
            });
            (text, has_calls)
        }
        Protocol::V1Response => {
            if let Some(text) = body.get("output_text").and_then(Value::as_str) {
                return (text.to_string(), false);
            }
            let items = body.get("output").and_then(Value::as_array);
            let text = items
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("content").and_then(Value::as_array))
                        .flatten()
                        .filter_map(|part| part.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            let has_calls = items.is_some_and(|items| {
                items
                    .iter()
                    .any(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
            });
            (text, has_calls)
        }
    }
}
