use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /v1/models` — the union of all tier pools.
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let config = state.config.snapshot();
    let created = Utc::now().timestamp();
    let data: Vec<Value> = config
        .models
        .all_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "switchboard",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}
