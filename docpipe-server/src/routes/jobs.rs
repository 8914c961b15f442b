use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use chrono::Utc;
use docpipe::{
    job::{Job, JobId, JobStatus},
    progress::ProgressView,
    store::{JobFilter, Scope, MAX_PAGE_SIZE},
};
use serde::{Deserialize, Serialize};

use super::{job_not_found, parse_job_id};
use crate::{
    auth::{AuthUser, WorkerAuth},
    error::ApiError,
    state::AppState,
};

const DEFAULT_PAGE_SIZE: u64 = 20;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    page: Option<u64>,
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    data: Vec<T>,
    page: u64,
    limit: u64,
    total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    #[serde(flatten)]
    job: Job,
    progress: u8,
    eta_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    message: &'static str,
    job_id: JobId,
    status: JobStatus,
    cancel_requested: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShouldCancelResponse {
    should_cancel: bool,
}

/// Jobs visible to the caller, newest first.
pub async fn list(
    user: AuthUser,
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Page<Job>>, ApiError> {
    let Query(query) = query?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let statuses = parse_statuses(query.status.as_deref())?;

    let filter = JobFilter::new(user.scope())
        .with_statuses(statuses)
        .paginate((page - 1).saturating_mul(limit), limit);
    let data = state.store.list(&filter).await?;
    let total = state.store.count(&filter).await?;

    Ok(Json(Page {
        data,
        page,
        limit,
        total,
    }))
}

pub async fn show(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = find(&state, &id, &user.scope()).await?;
    let view = ProgressView::project(&job, Utc::now());
    Ok(Json(JobResponse {
        progress: view.progress,
        eta_seconds: view.eta_seconds,
        job,
    }))
}

pub async fn progress(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProgressView>, ApiError> {
    let job = find(&state, &id, &user.scope()).await?;
    Ok(Json(ProgressView::project(&job, Utc::now())))
}

#[tracing::instrument(skip_all, fields(user = %user.id, job_id = %id))]
pub async fn cancel(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state.store.request_cancel(job_id, &user.scope()).await?;
    tracing::info!(status = %job.status, "Cancellation requested");
    Ok(Json(CancelResponse {
        message: "Cancellation requested",
        job_id: job.id,
        status: job.status,
        cancel_requested: job.cancel_requested,
    }))
}

/// Polled by workers between progress ticks.
pub async fn should_cancel(
    _: WorkerAuth,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ShouldCancelResponse>, ApiError> {
    let job = find(&state, &id, &Scope::Any).await?;
    Ok(Json(ShouldCancelResponse {
        should_cancel: job.should_cancel(),
    }))
}

async fn find(state: &AppState, id: &str, scope: &Scope) -> Result<Job, ApiError> {
    let job_id = parse_job_id(id)?;
    state
        .store
        .find(job_id, scope)
        .await?
        .ok_or_else(job_not_found)
}

fn parse_statuses(raw: Option<&str>) -> Result<Vec<JobStatus>, ApiError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|status| !status.is_empty())
        .map(|status| {
            status
                .parse()
                .map_err(|error: docpipe::job::status::UnknownStatus| {
                    ApiError::Validation(error.to_string())
                })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statuses_are_comma_separated() {
        assert_eq!(parse_statuses(None).unwrap(), vec![]);
        assert_eq!(
            parse_statuses(Some("queued, processing")).unwrap(),
            vec![JobStatus::Queued, JobStatus::Processing]
        );
        assert!(parse_statuses(Some("done")).is_err());
    }
}
