use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    queue: &'static str,
}

/// Liveness probe. A missing queue is reported but does not make the API unhealthy.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queue: if state.dispatcher.is_enabled() {
            "enabled"
        } else {
            "disabled"
        },
    })
}
