//! Capabilities and reporting for the docpipe worker process.
//!
//! The worker consumes stage work items from the queue and runs them with a
//! [`docpipe::executor::StageExecutor`] built from:
//!
//! - [`reporter::HttpReporter`], which sends every update to the API webhook
//!   and asks the API whether a job should be cancelled,
//! - [`extractor::HttpExtractor`], which runs OCR through an HTTP service,
//! - [`summarizer::OpenAiSummarizer`], which calls a chat completion endpoint.
pub mod config;
pub mod extractor;
pub mod reporter;
pub mod summarizer;

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use docpipe::{ingress::{IngressError, WORKER_SECRET_HEADER}, prelude::*};
    use serde_json::{json, Value};

    use crate::{
        extractor::HttpExtractor, reporter::HttpReporter, summarizer::OpenAiSummarizer,
    };

    const SECRET: &str = "worker-secret";

    #[derive(Clone)]
    struct Api {
        store: Arc<InMemoryStore>,
        ingress: WebhookIngress,
        secret: WorkerSecret,
    }

    fn status_of(error: &IngressError) -> StatusCode {
        match error {
            IngressError::MissingSecret => StatusCode::UNAUTHORIZED,
            IngressError::InvalidSecret => StatusCode::FORBIDDEN,
            IngressError::JobNotFound(_) => StatusCode::NOT_FOUND,
            IngressError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn authorize(api: &Api, headers: &HeaderMap) -> Result<(), StatusCode> {
        let presented = headers
            .get(WORKER_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        api.secret.verify(presented).map_err(|error| status_of(&error))
    }

    async fn webhook(
        State(api): State<Api>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<StatusCode, StatusCode> {
        authorize(&api, &headers)?;
        api.ingress
            .receive_bytes(&body)
            .await
            .map_err(|error| status_of(&error))?;
        Ok(StatusCode::OK)
    }

    async fn should_cancel(
        State(api): State<Api>,
        headers: HeaderMap,
        Path(id): Path<JobId>,
    ) -> Result<Json<Value>, StatusCode> {
        authorize(&api, &headers)?;
        let job = api
            .store
            .find(id, &Scope::Any)
            .await
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?
            .ok_or(StatusCode::NOT_FOUND)?;
        Ok(Json(json!({ "shouldCancel": job.should_cancel() })))
    }

    async fn ocr() -> &'static str {
        "{\"progress\":0.3}\n{\"progress\":0.9}\n{\"text\":\"Quarterly report\\nRevenue grew\"}\n"
    }

    async fn completions(Json(body): Json<Value>) -> Json<Value> {
        let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
        let first_line = prompt.rsplit("\n\n").next().unwrap_or_default().lines().next();
        Json(json!({
            "choices": [{ "message": { "content": format!("- {}", first_line.unwrap_or_default()) } }]
        }))
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    async fn wait_for_status(store: &InMemoryStore, id: JobId, status: JobStatus) -> Job {
        for _ in 0..300 {
            let job = store.find(id, &Scope::Any).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extraction_job_is_reported_over_http_until_completed() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let dispatcher = Dispatcher::new(queue.clone());
        let api = Api {
            store: store.clone(),
            ingress: WebhookIngress::new(store.clone(), dispatcher.clone()),
            secret: WorkerSecret::new(SECRET),
        };
        let api_url = serve(
            Router::new()
                .route("/api/v1/webhooks/file-processed", post(webhook))
                .route("/api/v1/jobs/:id/should-cancel", get(should_cancel))
                .with_state(api),
        )
        .await;
        let ocr_url = serve(Router::new().route("/ocr", post(ocr))).await;
        let openai_url =
            serve(Router::new().route("/v1/chat/completions", post(completions))).await;

        let executor = StageExecutor::new(
            Arc::new(HttpReporter::new(api_url, SECRET)),
            Arc::new(HttpExtractor::new(format!("{ocr_url}/ocr"))),
            Arc::new(OpenAiSummarizer::new(
                format!("{openai_url}/v1"),
                "sk-test",
                "gpt-4o-mini",
            )),
        )
        .with_stage_timeout(Duration::from_secs(5));
        let runtime = Docpipe::new(queue.clone(), executor)
            .with_max_concurrency(2)
            .with_stage(Stage::Extraction)
            .with_stage(Stage::Summarization);

        let job = JobBuilder::extract_text()
            .owned_by("user-1")
            .with_file_url("https://files.example.com/report.png")
            .enqueue(store.as_ref(), &dispatcher)
            .await
            .unwrap()
            .into_job();

        let done = wait_for_status(&store, job.id, JobStatus::Completed).await;
        runtime.graceful_shutdown().await.unwrap();

        assert_eq!(
            done.extracted_text.as_deref(),
            Some("Quarterly report\nRevenue grew")
        );
        assert_eq!(done.summary.as_deref(), Some("- Quarterly report"));
        assert_eq!(ProgressView::project(&done, done.updated_at).progress, 100);
        assert!(done.has_event(&TimelineEvent::OcrProgress));
        assert!(done.has_event(&TimelineEvent::SummarizationQueued));
        assert!(done.has_event(&TimelineEvent::SummarizationCompleted));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_job_is_stopped_by_the_worker() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let dispatcher = Dispatcher::new(queue.clone());
        let api = Api {
            store: store.clone(),
            ingress: WebhookIngress::new(store.clone(), dispatcher.clone()),
            secret: WorkerSecret::new(SECRET),
        };
        let api_url = serve(
            Router::new()
                .route("/api/v1/webhooks/file-processed", post(webhook))
                .route("/api/v1/jobs/:id/should-cancel", get(should_cancel))
                .with_state(api),
        )
        .await;

        let job = JobBuilder::extract_text()
            .owned_by("user-1")
            .with_file_url("https://files.example.com/report.png")
            .enqueue(store.as_ref(), &dispatcher)
            .await
            .unwrap()
            .into_job();
        store
            .apply(job.id, JobPatch::new().with_status(JobStatus::Processing))
            .await
            .unwrap();
        let flagged = store.request_cancel(job.id, &Scope::Any).await.unwrap();
        assert!(flagged.cancel_requested);

        let executor = StageExecutor::new(
            Arc::new(HttpReporter::new(api_url, SECRET)),
            Arc::new(HttpExtractor::new("http://127.0.0.1:1/ocr")),
            Arc::new(OpenAiSummarizer::new("http://127.0.0.1:1", "sk-test", "gpt-4o-mini")),
        );
        let runtime = Docpipe::new(queue.clone(), executor).with_stage(Stage::Extraction);

        let done = wait_for_status(&store, job.id, JobStatus::Cancelled).await;
        runtime.graceful_shutdown().await.unwrap();

        assert!(done.has_event(&TimelineEvent::JobCancelled));
        assert!(done.extracted_text.is_none());
    }
}
