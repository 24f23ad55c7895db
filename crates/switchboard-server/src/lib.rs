//! HTTP surface for the switchboard routing engine.
//!
//! Exposes the OpenAI-compatible `/v1/chat/completions` endpoint (buffered
//! and streaming), `/v1/models`, and a `/status` probe, behind an optional
//! gateway bearer key.

pub mod auth;
pub mod logging;
pub mod routes;
pub mod state;
pub mod stream;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tower_http::cors::{Any, CorsLayer};

use switchboard::http::HttpClientPool;
use switchboard::logging::LogSink;
use switchboard::tokens::TokenCounter;
use switchboard::{ConfigStore, HealthRegistry, IntentClassifier, Invoker, Orchestrator};

use state::AppState;

/// Wire the engine together from a loaded config store.
pub fn build_state(
    config: Arc<ConfigStore>,
    health: Arc<HealthRegistry>,
    sink: Arc<dyn LogSink>,
) -> Result<AppState> {
    let clients = Arc::new(HttpClientPool::new()?);
    let orchestrator = Arc::new(Orchestrator::new(
        Invoker::new(Arc::clone(&clients)),
        health,
    ));
    let classifier = Arc::new(IntentClassifier::new(clients));
    let counter = TokenCounter::new()?;
    Ok(AppState::new(config, orchestrator, classifier, sink, counter))
}

/// The full router with permissive CORS, as the gateway fronts browser UIs.
pub fn app(state: AppState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    routes::configure(state).layer(cors)
}

/// Convenience bootstrap used by the binary: load config and stats, spawn
/// the stats persister, and return the ready state.
pub fn bootstrap(
    config_path: &Path,
    stats_path: &Path,
    sink: Arc<dyn LogSink>,
) -> Result<AppState> {
    let config = Arc::new(ConfigStore::load(config_path)?);
    let decay_rate = config.snapshot().health.decay_rate;
    let health = Arc::new(HealthRegistry::load(stats_path, decay_rate));
    Arc::clone(&health).spawn_persister(stats_path.to_path_buf());
    build_state(config, health, sink)
}
