//! Tier-routing engine for OpenAI-compatible chat completion gateways.
//!
//! The pipeline: a request is classified into a tier, the tier's candidate
//! models are ordered by strategy, and the retry orchestrator walks them one
//! attempt at a time — committing health deltas, trace events, and a terminal
//! request log along the way. Streaming responses pass through byte-for-byte
//! while being reconstructed for audit.

pub mod classifier;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod invoker;
pub mod logging;
pub mod orchestrator;
pub mod params;
pub mod providers;
pub mod selection;
pub mod sse;
pub mod tokens;
pub mod trace;

pub use classifier::IntentClassifier;
pub use config::{AppConfig, ConfigStore, Tier};
pub use error::{FailureKind, RouteError, RouteResult};
pub use health::HealthRegistry;
pub use invoker::Invoker;
pub use logging::{JsonlSink, LogSink, RequestLog, RequestStatus};
pub use orchestrator::{Disposition, Orchestrator, RouteOutcome};
pub use trace::TraceRecorder;
