use super::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// GET /health
/// Liveness probe: OK while the supervisor loop keeps ticking
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.supervisor.is_alive() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "supervisor loop stalled")
    }
}

/// GET /status
/// Joined sessions and their running pipelines
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.supervisor.snapshot()))
}
