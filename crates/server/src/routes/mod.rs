//! API routes

pub mod generate;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and readiness
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/info", get(health::info))
        // Generation: SSE on POST, WebSocket upgrade on GET
        .route(
            "/api/v1/generate",
            post(generate::generate_sse).get(generate::generate_ws),
        )
        .with_state(state)
}
