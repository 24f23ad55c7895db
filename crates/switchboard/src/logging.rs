//! Terminal request records.
//!
//! One `RequestLog` is appended per request through the `LogSink` seam. The
//! bundled JSONL sink serializes writes through a single task; the persistent
//! log store behind the admin UI plugs in at the same trait.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::config::Tier;
use crate::tokens::TokenSource;
use crate::trace::TraceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Error,
    Aborted,
}

#[derive(Serialize)]
pub struct RequestLog {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_model: Option<String>,
    pub duration_ms: u64,
    pub status: RequestStatus,
    pub retry_count: u32,
    pub request_body: Value,
    pub response_body: Value,
    pub trace: Vec<TraceEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub token_source: TokenSource,
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, record: RequestLog);
}

/// Append-only JSONL file fed through one writer task.
pub struct JsonlSink {
    tx: mpsc::Sender<RequestLog>,
}

impl JsonlSink {
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestLog>(256);
        tokio::spawn(async move {
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!("cannot open request log {}: {e}", path.display());
                    return;
                }
            };
            while let Some(record) = rx.recv().await {
                let mut line = match serde_json::to_string(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("unserializable request log: {e}");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("request log write failed: {e}");
                }
            }
        });
        Self { tx }
    }
}

#[async_trait]
impl LogSink for JsonlSink {
    async fn append(&self, record: RequestLog) {
        if self.tx.send(record).await.is_err() {
            warn!("request log writer task is gone");
        }
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<RequestLog>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<RequestLog> {
        std::mem::take(&mut *self.records.lock().expect("sink lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogSink for MemorySink {
    async fn append(&self, record: RequestLog) {
        self.records.lock().expect("sink lock poisoned").push(record);
    }
}
