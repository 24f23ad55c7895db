use std::sync::Arc;

use switchboard::logging::LogSink;
use switchboard::tokens::TokenCounter;
use switchboard::{ConfigStore, IntentClassifier, Orchestrator};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub classifier: Arc<IntentClassifier>,
    pub sink: Arc<dyn LogSink>,
    pub counter: TokenCounter,
}

impl AppState {
    pub fn new(
        config: Arc<ConfigStore>,
        orchestrator: Arc<Orchestrator>,
        classifier: Arc<IntentClassifier>,
        sink: Arc<dyn LogSink>,
        counter: TokenCounter,
    ) -> Self {
        Self {
            config,
            orchestrator,
            classifier,
            sink,
            counter,
        }
    }
}
