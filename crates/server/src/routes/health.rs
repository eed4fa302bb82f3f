//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Readiness response
#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub world_size: usize,
}

/// Server info response
#[derive(Serialize)]
pub struct InfoResponse {
    pub version: String,
    pub rank: u32,
    pub world_size: usize,
    pub uptime_secs: u64,
    pub active_streams: usize,
    pub rounds_completed: u64,
    pub rounds_abandoned: u64,
    pub last_round: u64,
    pub max_unacked: u64,
    pub default_max_gen_len: u32,
    pub default_temperature: f32,
}

/// GET /health - Basic health check
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /ready - Readiness check (process group healthy)
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let is_ready = state.is_ready();
    let status = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready: is_ready,
            world_size: state.info.world_size,
        }),
    )
}

/// GET /v1/info - Server information
pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let stats = state.dispatcher.stats();
    Json(InfoResponse {
        version: state.info.version.clone(),
        rank: state.info.rank,
        world_size: state.info.world_size,
        uptime_secs: state.uptime().as_secs(),
        active_streams: state.active_streams(),
        rounds_completed: stats.rounds_completed,
        rounds_abandoned: stats.rounds_abandoned,
        last_round: stats.last_round,
        max_unacked: state.config.max_unacked,
        default_max_gen_len: state.config.default_max_gen_len,
        default_temperature: state.config.default_temperature,
    })
}
