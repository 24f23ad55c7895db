//! Transparent SSE passthrough.
//!
//! Upstream bytes are forwarded to the client unchanged while a decoded copy
//! accumulates for the request log. The pump runs as its own task feeding a
//! bounded channel, so client back-pressure propagates to the upstream read
//! and a dropped client shows up as a closed channel.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use switchboard::config::Tier;
use switchboard::error::FailureKind;
use switchboard::health::HealthRegistry;
use switchboard::logging::{LogSink, RequestLog, RequestStatus};
use switchboard::providers::ModelRef;
use switchboard::sse::{DeltaAggregator, SseLineBuffer};
use switchboard::tokens::{usage_from_body, TokenCounter};
use switchboard::trace::{Stage, TraceRecorder, TraceStatus};

/// Cap on the reconstructed text kept for the log; the client stream is
/// never truncated.
const LOG_BUFFER_CAP: usize = 4 * 1024 * 1024;

const CHANNEL_DEPTH: usize = 32;

pub struct StreamContext {
    pub trace: Arc<TraceRecorder>,
    pub health: Arc<HealthRegistry>,
    pub sink: Arc<dyn LogSink>,
    pub counter: TokenCounter,
    pub tier: Tier,
    pub chosen: ModelRef,
    pub retry_count: u32,
    pub request_body: Value,
    pub messages: Vec<Value>,
    pub generation_timeout: Duration,
    pub retry_on_empty: bool,
}

/// Wire the upstream response to a client body and spawn the pump.
pub fn passthrough(upstream: reqwest::Response, ctx: StreamContext) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(CHANNEL_DEPTH);
    tokio::spawn(pump(upstream, ctx, tx));
    Body::from_stream(ReceiverStream::new(rx))
}

enum Ending {
    /// Upstream finished; `[DONE]` may or may not have been seen.
    Eof,
    /// Upstream died or overran the generation budget mid-stream.
    Failure(FailureKind, String),
    /// The client hung up on us.
    ClientGone,
}

async fn pump(
    upstream: reqwest::Response,
    ctx: StreamContext,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
) {
    let canonical = ctx.chosen.canonical();
    let mut lines = SseLineBuffer::new();
    let mut aggregator = DeltaAggregator::new(LOG_BUFFER_CAP);
    let mut stream = upstream.bytes_stream();
    let deadline = tokio::time::Instant::now() + ctx.generation_timeout;
    let mut first = true;

    let ending = loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                break Ending::Failure(
                    FailureKind::TimeoutGeneration,
                    format!(
                        "stream not complete within {}ms",
                        ctx.generation_timeout.as_millis()
                    ),
                );
            }
            Ok(None) => break Ending::Eof,
            Ok(Some(Err(e))) => {
                break Ending::Failure(
                    FailureKind::StreamAbort,
                    format!("upstream stream failed: {e}"),
                );
            }
            Ok(Some(Ok(bytes))) => {
                if first {
                    first = false;
                    ctx.trace.record(
                        Stage::FirstToken,
                        TraceStatus::Info,
                        Some(&ctx.chosen.model),
                        Some(&ctx.chosen.provider_id),
                        None,
                        ctx.retry_count,
                    );
                }
                for payload in lines.push(&bytes) {
                    aggregator.absorb(&payload);
                }
                if tx.send(Ok(bytes)).await.is_err() {
                    break Ending::ClientGone;
                }
            }
        }
    };

    match ending {
        Ending::ClientGone => {
            // no penalty: the model did nothing wrong
            ctx.trace.record(
                Stage::ClientAbort,
                TraceStatus::Info,
                Some(&ctx.chosen.model),
                Some(&ctx.chosen.provider_id),
                Some("client disconnected".to_string()),
                ctx.retry_count,
            );
            finalize(&ctx, &canonical, RequestStatus::Aborted, &aggregator).await;
        }
        Ending::Failure(kind, reason) => {
            // bytes are committed; this attempt cannot retry but still
            // counts against the model
            ctx.health.on_failure(&canonical, kind);
            ctx.trace.record(
                Stage::ModelFail,
                TraceStatus::Fail,
                Some(&ctx.chosen.model),
                Some(&ctx.chosen.provider_id),
                Some(reason.clone()),
                ctx.retry_count + 1,
            );
            warn!(model = %canonical, kind = kind.as_str(), %reason, "stream failed mid-flight");

            let error_event = format!(
                "data: {}\n\n",
                json!({"error": {"kind": kind.as_str(), "message": reason}})
            );
            let _ = tx.send(Ok(Bytes::from(error_event))).await;
            let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
            ctx.trace.record(
                Stage::FullResponse,
                TraceStatus::Fail,
                Some(&ctx.chosen.model),
                Some(&ctx.chosen.provider_id),
                Some("stream closed after mid-flight failure".to_string()),
                ctx.retry_count,
            );
            finalize(&ctx, &canonical, RequestStatus::Error, &aggregator).await;
        }
        Ending::Eof => {
            if !aggregator.saw_done() {
                let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
            }
            if aggregator.is_empty() && ctx.retry_on_empty {
                // too late to fail over, but the health model should know
                ctx.health.on_failure(&canonical, FailureKind::EmptyResponse);
                ctx.trace.record(
                    Stage::FullResponse,
                    TraceStatus::Fail,
                    Some(&ctx.chosen.model),
                    Some(&ctx.chosen.provider_id),
                    Some("empty completion".to_string()),
                    ctx.retry_count,
                );
                finalize(&ctx, &canonical, RequestStatus::Error, &aggregator).await;
            } else {
                ctx.health.on_success(&canonical);
                ctx.trace.record(
                    Stage::FullResponse,
                    TraceStatus::Success,
                    Some(&ctx.chosen.model),
                    Some(&ctx.chosen.provider_id),
                    None,
                    ctx.retry_count,
                );
                finalize(&ctx, &canonical, RequestStatus::Success, &aggregator).await;
            }
        }
    }
}

async fn finalize(
    ctx: &StreamContext,
    canonical: &str,
    status: RequestStatus,
    aggregator: &DeltaAggregator,
) {
    // token accounting happens here, on the assembled text, after the client
    // has everything
    let usage = aggregator
        .usage()
        .and_then(|trailer| usage_from_body(&json!({"usage": trailer})))
        .unwrap_or_else(|| ctx.counter.local_usage(&ctx.messages, aggregator.content()));

    let mut response_body = json!({
        "id": format!("chatcmpl-{}", ctx.trace.request_id().as_simple()),
        "object": "chat.completion",
        "created": ctx.trace.started_at().timestamp(),
        "model": ctx.chosen.model,
        "choices": [{
            "index": 0,
            "message": aggregator.to_message(),
            "finish_reason": aggregator.finish_reason(),
        }],
    });
    if aggregator.truncated() {
        response_body["truncated"] = Value::Bool(true);
    }

    ctx.sink
        .append(RequestLog {
            id: ctx.trace.request_id(),
            received_at: ctx.trace.started_at(),
            tier: ctx.tier,
            chosen_model: Some(canonical.to_string()),
            duration_ms: ctx.trace.elapsed_ms(),
            status,
            retry_count: ctx.retry_count,
            request_body: ctx.request_body.clone(),
            response_body,
            trace: ctx.trace.snapshot(),
            stack_trace: None,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            token_source: usage.source,
        })
        .await;
}
