//! Per-request trace timeline.
//!
//! Stages are appended in order during routing and move into the request log
//! at terminal. Durations come from a monotonic clock; absolute timestamps
//! from the wall clock.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    #[serde(rename = "REQ_RECEIVED")]
    ReqReceived,
    #[serde(rename = "ROUTER_START")]
    RouterStart,
    #[serde(rename = "ROUTER_END")]
    RouterEnd,
    #[serde(rename = "ROUTER_FAIL")]
    RouterFail,
    #[serde(rename = "MODEL_CALL_START")]
    ModelCallStart,
    #[serde(rename = "FIRST_TOKEN")]
    FirstToken,
    #[serde(rename = "FULL_RESPONSE")]
    FullResponse,
    #[serde(rename = "MODEL_FAIL")]
    ModelFail,
    #[serde(rename = "ALL_FAILED")]
    AllFailed,
    #[serde(rename = "CLIENT_ABORT")]
    ClientAbort,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ReqReceived => "REQ_RECEIVED",
            Stage::RouterStart => "ROUTER_START",
            Stage::RouterEnd => "ROUTER_END",
            Stage::RouterFail => "ROUTER_FAIL",
            Stage::ModelCallStart => "MODEL_CALL_START",
            Stage::FirstToken => "FIRST_TOKEN",
            Stage::FullResponse => "FULL_RESPONSE",
            Stage::ModelFail => "MODEL_FAIL",
            Stage::AllFailed => "ALL_FAILED",
            Stage::ClientAbort => "CLIENT_ABORT",
        }
    }

    /// True for the stages that may close a trace.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::FullResponse | Stage::AllFailed | Stage::ClientAbort
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Info,
    Success,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub status: TraceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub retry_count: u32,
}

/// Append-only event collector for one request. Safe to share with the
/// streaming passthrough task.
pub struct TraceRecorder {
    request_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceRecorder {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            started_at: Utc::now(),
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn record(
        &self,
        stage: Stage,
        status: TraceStatus,
        model: Option<&str>,
        provider: Option<&str>,
        reason: Option<String>,
        retry_count: u32,
    ) {
        let event = TraceEvent {
            stage,
            timestamp: Utc::now(),
            elapsed_ms: self.elapsed_ms(),
            status,
            model: model.map(str::to_string),
            provider: provider.map(str::to_string),
            reason,
            retry_count,
        };
        tracing::info!(
            request_id = %short_id(&self.request_id),
            stage = stage.as_str(),
            status = ?status,
            elapsed_ms = event.elapsed_ms,
            model = event.model.as_deref().unwrap_or(""),
            reason = event.reason.as_deref().unwrap_or(""),
            retry_count,
            "trace"
        );
        self.events.lock().expect("trace lock poisoned").push(event);
    }

    /// Shorthand for stages that carry no model context.
    pub fn mark(&self, stage: Stage, status: TraceStatus) {
        self.record(stage, status, None, None, None, 0);
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().expect("trace lock poisoned").clone()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }
}

fn short_id(id: &Uuid) -> String {
    id.as_simple().to_string()[..8].to_string()
}
