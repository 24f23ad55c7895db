pub mod completions;
pub mod models;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth;
use crate::state::AppState;

pub fn configure(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(completions::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/status", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_gateway_key,
        ))
        .with_state(state)
}
