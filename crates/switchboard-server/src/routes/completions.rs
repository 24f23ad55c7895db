//! The `/v1/chat/completions` gateway handler.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use switchboard::config::Tier;
use switchboard::logging::{RequestLog, RequestStatus};
use switchboard::tokens::{TokenSource, TokenUsage};
use switchboard::trace::{Stage, TraceRecorder, TraceStatus};
use switchboard::{Disposition, RouteError};

use crate::state::AppState;
use crate::stream::{self, StreamContext};

pub async fn chat_completions(State(state): State<AppState>, Json(raw): Json<Value>) -> Response {
    let Some(body_map) = raw.as_object().cloned() else {
        return bad_request("request body must be a JSON object");
    };
    let messages: Vec<Value> = match body_map.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => messages.clone(),
        _ => return bad_request("'messages' must be a non-empty array"),
    };
    let client_streaming = body_map.get("stream").and_then(Value::as_bool) == Some(true);

    let config = state.config.snapshot();
    let trace = Arc::new(TraceRecorder::new(Uuid::new_v4()));
    trace.mark(Stage::ReqReceived, TraceStatus::Info);

    let tier = state.classifier.classify(&config, &messages, &trace).await;

    let run = state
        .orchestrator
        .run(&config, tier, &body_map, client_streaming, &trace)
        .await;

    match run {
        Ok(outcome) => match outcome.disposition {
            Disposition::Completed { status, body } => {
                let chosen = outcome.chosen.canonical();
                if status.is_success() {
                    let usage = outcome.usage.unwrap_or_else(|| {
                        state.counter.local_usage(&messages, &outcome.assistant_text)
                    });
                    commit_log(
                        &state,
                        &trace,
                        tier,
                        Some(chosen),
                        outcome.retry_count,
                        RequestStatus::Success,
                        Value::Object(body_map),
                        body.clone(),
                        None,
                        Some(usage),
                    )
                    .await;
                    if client_streaming {
                        sse_response(json_to_sse(&body, &outcome.assistant_text))
                    } else {
                        (status, Json(body)).into_response()
                    }
                } else {
                    // verbatim upstream error; retrying would not have helped
                    commit_log(
                        &state,
                        &trace,
                        tier,
                        Some(chosen),
                        outcome.retry_count,
                        RequestStatus::Error,
                        Value::Object(body_map),
                        body.clone(),
                        None,
                        None,
                    )
                    .await;
                    (status, Json(body)).into_response()
                }
            }
            Disposition::Streaming {
                response,
                generation_timeout,
            } => {
                let ctx = StreamContext {
                    trace: Arc::clone(&trace),
                    health: Arc::clone(state.orchestrator.health()),
                    sink: Arc::clone(&state.sink),
                    counter: state.counter.clone(),
                    tier,
                    chosen: outcome.chosen,
                    retry_count: outcome.retry_count,
                    request_body: Value::Object(body_map),
                    messages,
                    generation_timeout,
                    retry_on_empty: config.retries.conditions.retry_on_empty,
                };
                event_stream_response(stream::passthrough(response, ctx))
            }
        },
        Err(err) => {
            let (status, envelope) = error_envelope(&err);
            let stack_trace = match &err {
                RouteError::Internal(inner) => {
                    error!("unexpected routing failure: {inner:?}");
                    Some(format!("{inner:?}"))
                }
                _ => None,
            };
            if !trace
                .snapshot()
                .last()
                .is_some_and(|event| event.stage.is_terminal())
            {
                trace.record(
                    Stage::AllFailed,
                    TraceStatus::Fail,
                    None,
                    None,
                    Some(err.to_string()),
                    0,
                );
            }
            commit_log(
                &state,
                &trace,
                tier,
                None,
                0,
                RequestStatus::Error,
                Value::Object(body_map),
                envelope.clone(),
                stack_trace,
                None,
            )
            .await;
            (status, Json(envelope)).into_response()
        }
    }
}

fn error_envelope(err: &RouteError) -> (StatusCode, Value) {
    match err {
        RouteError::Exhausted {
            attempted,
            last_reason,
        } => (
            StatusCode::BAD_GATEWAY,
            json!({"error": {
                "kind": "exhausted",
                "attempted": attempted,
                "last_reason": last_reason,
            }}),
        ),
        RouteError::ProviderMissing(entry) => (
            StatusCode::BAD_GATEWAY,
            json!({"error": {
                "kind": "provider_missing",
                "message": format!("no provider configured for '{entry}'"),
            }}),
        ),
        RouteError::BadRequest(message) => (
            StatusCode::BAD_REQUEST,
            json!({"error": {"kind": "bad_request", "message": message}}),
        ),
        RouteError::ClientAbort => (
            StatusCode::BAD_REQUEST,
            json!({"error": {"kind": "client_abort"}}),
        ),
        RouteError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": {"kind": "internal", "message": "internal gateway error"}}),
        ),
    }
}

#[allow(clippy::too_many_arguments)]
async fn commit_log(
    state: &AppState,
    trace: &TraceRecorder,
    tier: Tier,
    chosen_model: Option<String>,
    retry_count: u32,
    status: RequestStatus,
    request_body: Value,
    response_body: Value,
    stack_trace: Option<String>,
    usage: Option<TokenUsage>,
) {
    let (prompt_tokens, completion_tokens, token_source) = match usage {
        Some(usage) => (usage.prompt_tokens, usage.completion_tokens, usage.source),
        None => (0, 0, TokenSource::Local),
    };
    state
        .sink
        .append(RequestLog {
            id: trace.request_id(),
            received_at: trace.started_at(),
            tier,
            chosen_model,
            duration_ms: trace.elapsed_ms(),
            status,
            retry_count,
            request_body,
            response_body,
            trace: trace.snapshot(),
            stack_trace,
            prompt_tokens,
            completion_tokens,
            token_source,
        })
        .await;
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"message": message, "type": "invalid_request_error"}})),
    )
        .into_response()
}

/// Re-frame a buffered completion as a short SSE sequence for clients that
/// asked to stream: role chunk, content chunk, tool-call chunks, finish chunk
/// with usage, then `[DONE]`. Bodies from non-OpenAI upstream flavors carry
/// no `choices`; the extracted assistant text stands in for them.
fn json_to_sse(body: &Value, fallback_text: &str) -> Vec<String> {
    let chunk_id = body
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("chatcmpl-switchboard")
        .to_string();
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let created = body.get("created").and_then(Value::as_i64).unwrap_or(0);

    let choice = body
        .pointer("/choices/0")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or(fallback_text);
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop");

    let delta_chunk = |delta: Value| {
        format!(
            "data: {}\n\n",
            json!({
                "id": chunk_id.clone(),
                "object": "chat.completion.chunk",
                "created": created,
                "model": model.clone(),
                "choices": [{"index": 0, "delta": delta, "finish_reason": null}],
            })
        )
    };

    let mut chunks = vec![delta_chunk(json!({"role": "assistant"}))];
    if !content.is_empty() {
        chunks.push(delta_chunk(json!({"content": content})));
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            let mut delta_call = call.clone();
            delta_call["index"] = json!(index);
            chunks.push(delta_chunk(json!({"tool_calls": [delta_call]})));
        }
    }

    let mut finish = json!({
        "id": chunk_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}],
    });
    if let Some(usage) = body.get("usage") {
        finish["usage"] = usage.clone();
    }
    chunks.push(format!("data: {finish}\n\n"));
    chunks.push("data: [DONE]\n\n".to_string());
    chunks
}

fn sse_response(chunks: Vec<String>) -> Response {
    event_stream_response(Body::from(chunks.join("")))
}

fn event_stream_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
