use async_trait::async_trait;
use docpipe::{
    ingress::{WebhookPayload, WORKER_SECRET_HEADER},
    job::JobId,
    reporter::{ReportError, Reporter},
};
use reqwest::StatusCode;
use serde::Deserialize;

/// Reports to the API's webhook over HTTP.
#[derive(Clone)]
pub struct HttpReporter {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShouldCancel {
    should_cancel: bool,
}

impl HttpReporter {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            secret: secret.into(),
        }
    }

    fn check(response: &reqwest::Response, job_id: Option<JobId>) -> Result<(), ReportError> {
        let status = response.status();
        match (status, job_id) {
            (status, _) if status.is_success() => Ok(()),
            (StatusCode::NOT_FOUND, Some(job_id)) => Err(ReportError::JobNotFound(job_id)),
            (status, _) if status.is_client_error() => {
                Err(ReportError::Rejected(format!("API answered {status}")))
            }
            (status, _) => Err(ReportError::Transport(format!("API answered {status}"))),
        }
    }
}

impl std::fmt::Debug for HttpReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReporter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

fn transport(error: reqwest::Error) -> ReportError {
    ReportError::Transport(error.to_string())
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report(&self, payload: &WebhookPayload) -> Result<(), ReportError> {
        let response = self
            .client
            .post(format!("{}/api/v1/webhooks/file-processed", self.base_url))
            .header(WORKER_SECRET_HEADER, &self.secret)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;
        let job_id = payload.job_id.as_deref().and_then(|id| id.parse().ok());
        Self::check(&response, job_id).inspect_err(|error| {
            tracing::warn!(?error, event = payload.event.as_deref(), "Webhook update not accepted");
        })
    }

    async fn should_cancel(&self, job_id: JobId) -> Result<bool, ReportError> {
        let response = self
            .client
            .get(format!("{}/api/v1/jobs/{job_id}/should-cancel", self.base_url))
            .header(WORKER_SECRET_HEADER, &self.secret)
            .send()
            .await
            .map_err(transport)?;
        Self::check(&response, Some(job_id))?;
        let body: ShouldCancel = response.json().await.map_err(transport)?;
        Ok(body.should_cancel)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use docpipe::job::TimelineEvent;
    use serde_json::{json, Value};

    use super::*;

    const SECRET: &str = "worker-secret";

    #[derive(Clone, Default)]
    struct Api {
        received: Arc<Mutex<Vec<Value>>>,
        cancelled: Arc<Mutex<Vec<String>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get(WORKER_SECRET_HEADER)
            .is_some_and(|value| value == SECRET)
    }

    async fn webhook(
        State(api): State<Api>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        if !authorized(&headers) {
            return StatusCode::FORBIDDEN;
        }
        if body["jobId"] == "00000000-0000-0000-0000-000000000000" {
            return StatusCode::NOT_FOUND;
        }
        if body["event"] == "explode" {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        api.received.lock().unwrap().push(body);
        StatusCode::OK
    }

    async fn should_cancel(
        State(api): State<Api>,
        headers: HeaderMap,
        Path(id): Path<String>,
    ) -> Result<Json<Value>, StatusCode> {
        if !authorized(&headers) {
            return Err(StatusCode::FORBIDDEN);
        }
        let cancelled = api.cancelled.lock().unwrap().contains(&id);
        Ok(Json(json!({ "shouldCancel": cancelled })))
    }

    async fn serve(api: Api) -> String {
        let app = Router::new()
            .route("/api/v1/webhooks/file-processed", post(webhook))
            .route("/api/v1/jobs/:id/should-cancel", get(should_cancel))
            .with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn updates_carry_the_secret() {
        let api = Api::default();
        let reporter = HttpReporter::new(serve(api.clone()).await, SECRET);
        let job_id = JobId::new();

        reporter
            .report(&WebhookPayload::event(job_id, TimelineEvent::OcrProgress).with_progress(40))
            .await
            .unwrap();

        let received = api.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["jobId"], job_id.to_string());
        assert_eq!(received[0]["event"], "ocr_progress");
        assert_eq!(received[0]["progress"], 40);
    }

    #[tokio::test]
    async fn responses_map_to_report_errors() {
        let base_url = serve(Api::default()).await;
        let reporter = HttpReporter::new(base_url.clone(), SECRET);

        let missing: JobId = "00000000-0000-0000-0000-000000000000".parse().unwrap();
        assert_matches!(
            reporter
                .report(&WebhookPayload::event(missing, TimelineEvent::ExtractionStarted))
                .await,
            Err(ReportError::JobNotFound(id)) if id == missing
        );
        assert_matches!(
            reporter
                .report(&WebhookPayload::event(
                    JobId::new(),
                    TimelineEvent::Other("explode".to_owned())
                ))
                .await,
            Err(ReportError::Transport(_))
        );
        assert_matches!(
            HttpReporter::new(base_url, "wrong")
                .report(&WebhookPayload::event(JobId::new(), TimelineEvent::ExtractionStarted))
                .await,
            Err(ReportError::Rejected(_))
        );
    }

    #[tokio::test]
    async fn should_cancel_reads_the_flag() {
        let api = Api::default();
        let reporter = HttpReporter::new(serve(api.clone()).await, SECRET);
        let job_id = JobId::new();

        assert!(!reporter.should_cancel(job_id).await.unwrap());
        api.cancelled.lock().unwrap().push(job_id.to_string());
        assert!(reporter.should_cancel(job_id).await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transport_error() {
        let reporter = HttpReporter::new("http://127.0.0.1:1", SECRET);
        assert_matches!(
            reporter.should_cancel(JobId::new()).await,
            Err(ReportError::Transport(_))
        );
    }
}
