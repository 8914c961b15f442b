use axum::{body::Bytes, extract::State, Json};
use docpipe::{
    ingress::ChainOutcome,
    job::{JobId, JobStatus},
};
use serde::Serialize;

use crate::{auth::WorkerAuth, error::ApiError, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    received: bool,
    job_id: JobId,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    summarization: Option<&'static str>,
}

/// Status updates from workers. The secret is checked before the body is read.
pub async fn file_processed(
    _: WorkerAuth,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let receipt = state.ingress.receive_bytes(&body).await?;
    Ok(Json(WebhookResponse {
        received: true,
        job_id: receipt.job.id,
        status: receipt.job.status,
        summarization: receipt.chained.map(|outcome| match outcome {
            ChainOutcome::Queued(_) => "queued",
            ChainOutcome::Deferred(_) => "deferred",
        }),
    }))
}
