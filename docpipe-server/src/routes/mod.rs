use axum::{
    routing::{delete, get, post},
    Router,
};
use docpipe::job::JobId;

use crate::{error::ApiError, state::AppState};

mod ai;
mod health;
mod jobs;
mod stream;
mod webhooks;

/// Every route of the API, relative to its `/api/v1` prefix.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/ai/extract-text", post(ai::extract_text))
        .route("/ai/summarize", post(ai::summarize))
        .route("/jobs", get(jobs::list))
        .route("/jobs/:id", get(jobs::show))
        .route("/jobs/:id/progress", get(jobs::progress))
        .route("/jobs/:id/stream", get(stream::stream_progress))
        .route("/jobs/:id/cancel", delete(jobs::cancel))
        .route("/jobs/:id/should-cancel", get(jobs::should_cancel))
        .route("/webhooks/file-processed", post(webhooks::file_processed))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Validation(format!("Invalid job id: {raw}")))
}

fn job_not_found() -> ApiError {
    ApiError::NotFound("Job not found".to_owned())
}
