//! Upstream request body composition.
//!
//! Precedence, lowest to highest: global defaults < client payload <
//! model-specific overrides. Model params overwrite whole values; nested
//! objects are not merged key-by-key.

use serde_json::{Map, Value};

use crate::config::{AppConfig, Protocol};

/// Build the final upstream body from the client payload.
///
/// The outgoing `model` field is always the bare model name (no provider
/// prefix). Protocols that cannot stream get `stream: false` regardless of
/// what the client asked for.
pub fn compose(
    config: &AppConfig,
    client_body: &Map<String, Value>,
    bare_model: &str,
    protocol: Protocol,
) -> Map<String, Value> {
    let mut body = client_body.clone();

    for (key, value) in &config.params.global_params {
        body.entry(key.clone()).or_insert_with(|| value.clone());
    }

    if let Some(overrides) = config.params.model_params.get(bare_model) {
        for (key, value) in overrides {
            body.insert(key.clone(), value.clone());
        }
    }

    body.insert("model".to_string(), Value::String(bare_model.to_string()));
    if !protocol.allows_streaming() {
        body.insert("stream".to_string(), Value::Bool(false));
    }

    body
}
