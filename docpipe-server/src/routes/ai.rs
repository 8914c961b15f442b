use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use docpipe::job::{
    builder::{Enqueued, JobBuilder},
    JobId, JobStatus,
};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

const EXTRACT_ONLY: &str = "extract-only";
const MIN_TEXT_CHARS: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractTextRequest {
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    message: &'static str,
    job_id: JobId,
    status: JobStatus,
    queue_ref: Option<String>,
}

pub async fn extract_text(
    user: AuthUser,
    State(state): State<AppState>,
    request: Result<Json<ExtractTextRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let Json(request) = request?;
    let file_url = request
        .file_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::Validation("fileUrl is required".to_owned()))?;
    validate_file_url(file_url)?;

    let builder = match request.mode.as_deref() {
        Some(EXTRACT_ONLY) => JobBuilder::ocr_only(),
        _ => JobBuilder::extract_text(),
    };
    enqueue(
        &state,
        builder
            .owned_by(user.id)
            .with_file_url(file_url)
            .notify(user.email),
    )
    .await
}

pub async fn summarize(
    user: AuthUser,
    State(state): State<AppState>,
    request: Result<Json<SummarizeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let Json(request) = request?;
    let text = request.text.unwrap_or_default();
    if text.trim().chars().count() < MIN_TEXT_CHARS {
        return Err(ApiError::Validation(format!(
            "text must be at least {MIN_TEXT_CHARS} characters"
        )));
    }

    enqueue(
        &state,
        JobBuilder::summarize()
            .owned_by(user.id)
            .with_text(text)
            .notify(user.email),
    )
    .await
}

fn validate_file_url(file_url: &str) -> Result<(), ApiError> {
    let url = reqwest::Url::parse(file_url)
        .map_err(|_| ApiError::Validation("fileUrl must be an absolute URL".to_owned()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ApiError::Validation(format!(
            "fileUrl scheme {scheme} is not supported"
        ))),
    }
}

async fn enqueue(
    state: &AppState,
    builder: JobBuilder,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    match builder
        .enqueue(state.store.as_ref(), &state.dispatcher)
        .await?
    {
        Enqueued::Published { job, handle } => Ok((
            StatusCode::ACCEPTED,
            Json(EnqueueResponse {
                message: "Job queued",
                job_id: job.id,
                status: job.status,
                queue_ref: Some(handle.to_string()),
            }),
        )),
        Enqueued::Deferred { job, reason } => Err(ApiError::QueueUnavailable {
            job_id: job.id,
            reason: reason.to_string(),
        }),
    }
}
