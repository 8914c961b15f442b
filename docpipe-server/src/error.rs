use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Request, State,
    },
    http::{header::CONTENT_LENGTH, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use docpipe::{
    ingress::IngressError,
    job::JobId,
    queue::QueueError,
    store::StoreError,
    DocpipeError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::AppState;

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            request_id: None,
            job_id: None,
        }
    }
}

/// Details withheld from an internal error response.
#[derive(Debug, Clone)]
struct Withheld(String);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Job {job_id} was accepted but could not be queued: {reason}")]
    QueueUnavailable { job_id: JobId, reason: String },
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::QueueUnavailable { .. } | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut withheld = None;
        let body = match self {
            Self::QueueUnavailable { job_id, reason } => {
                tracing::warn!(%job_id, %reason, "Job accepted in degraded mode");
                ErrorResponse {
                    details: Some(reason),
                    job_id: Some(job_id),
                    ..ErrorResponse::new("Job accepted but the queue is unavailable")
                }
            }
            Self::Unavailable(details) => {
                tracing::error!(%details, "Backing service unavailable");
                withheld = Some(Withheld(details));
                ErrorResponse::new("Service unavailable")
            }
            Self::Internal(details) => {
                tracing::error!(%details, "Internal error");
                withheld = Some(Withheld(details));
                ErrorResponse::new("Internal server error")
            }
            other => ErrorResponse::new(other.to_string()),
        };

        let mut response = (status, Json(body.clone())).into_response();
        response.extensions_mut().insert(body);
        if let Some(withheld) = withheld {
            response.extensions_mut().insert(withheld);
        }
        response
    }
}

/// Stamps error bodies with the request id and, when configured, the withheld details.
pub async fn finish_error_response(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let mut response = next.run(request).await;
    let Some(mut body) = response.extensions_mut().remove::<ErrorResponse>() else {
        return response;
    };
    if let Some(Withheld(details)) = response.extensions_mut().remove::<Withheld>() {
        if state.expose_internal_errors {
            body.details = Some(details);
        }
    }
    body.request_id = request_id;

    let (mut parts, _) = response.into_parts();
    parts.headers.remove(CONTENT_LENGTH);
    match serde_json::to_vec(&body) {
        Ok(bytes) => Response::from_parts(parts, Body::from(bytes)),
        Err(error) => {
            tracing::error!(?error, "Failed to encode error response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::JobNotFound(_) => Self::NotFound("Job not found".to_owned()),
            StoreError::AlreadyFinished { status, .. } => {
                Self::Conflict(format!("Job already {status}"))
            }
            StoreError::Unavailable(details) => Self::Unavailable(details),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<IngressError> for ApiError {
    fn from(value: IngressError) -> Self {
        match value {
            IngressError::MissingSecret => Self::Unauthorized(value.to_string()),
            IngressError::InvalidSecret => Self::Forbidden(value.to_string()),
            IngressError::MissingJobId
            | IngressError::InvalidJobId(_)
            | IngressError::MalformedPayload(_) => Self::Validation(value.to_string()),
            IngressError::JobNotFound(_) => Self::NotFound("Job not found".to_owned()),
            IngressError::Store(error) => error.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self::Validation(value.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(value: QueryRejection) -> Self {
        Self::Validation(value.body_text())
    }
}

impl From<DocpipeError> for ApiError {
    fn from(value: DocpipeError) -> Self {
        match value {
            DocpipeError::Validation(message) => Self::Validation(message),
            DocpipeError::Store(error) => error.into(),
            DocpipeError::Queue(QueueError::Unavailable(details)) => Self::Unavailable(details),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn body_of(response: Response) -> ErrorResponse {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn internal_details_are_withheld() {
        let response = ApiError::Internal("connection string leaked".to_owned()).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(response).await;
        assert_eq!(body.error, "Internal server error");
        assert!(body.details.is_none());
    }

    #[tokio::test]
    async fn deferred_enqueue_carries_the_job_id() {
        let job_id = JobId::new();
        let response = ApiError::QueueUnavailable {
            job_id,
            reason: "no queue configured".to_owned(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_of(response).await;
        assert_eq!(body.job_id, Some(job_id));
        assert_eq!(body.details.as_deref(), Some("no queue configured"));
    }

    #[test]
    fn store_errors_map_to_the_taxonomy() {
        let id = JobId::new();
        assert_eq!(
            ApiError::from(StoreError::JobNotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::AlreadyFinished {
                id,
                status: docpipe::job::JobStatus::Completed
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::BadState).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn secret_errors_distinguish_missing_from_wrong() {
        assert_eq!(
            ApiError::from(IngressError::MissingSecret).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(IngressError::InvalidSecret).status(),
            StatusCode::FORBIDDEN
        );
    }
}
