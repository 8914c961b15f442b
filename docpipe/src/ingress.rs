//! Authenticated entry point for worker status updates.
//!
//! Workers never write to the store directly, every change they report is
//! normalized and applied here. The ingress is also where a finished
//! extraction is chained into summarization.
use std::sync::Arc;

use chrono::Utc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::instrument;

use crate::{
    job::{Job, JobId, JobPatch, JobStatus, TimelineEntry, TimelineEvent},
    notifier::{Notifier, TracingNotifier},
    queue::{Dispatcher, ItemHandle, QueueError, WorkItem},
    store::{JobStore, Patched, StoreError},
};

mod payload;

pub use payload::{WebhookPayload, WebhookUpdate};

/// Header carrying the shared secret on worker requests.
pub const WORKER_SECRET_HEADER: &str = "x-worker-secret";

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Missing worker secret")]
    MissingSecret,
    #[error("Invalid worker secret")]
    InvalidSecret,
    #[error("jobId is required")]
    MissingJobId,
    #[error("Malformed jobId: {0}")]
    InvalidJobId(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Error communicating with the job store")]
    Store(#[source] StoreError),
}

impl From<StoreError> for IngressError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::JobNotFound(id) => Self::JobNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Shared secret between the API and the workers.
#[derive(Clone)]
pub struct WorkerSecret(Arc<str>);

impl WorkerSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Arc::from(secret.into()))
    }

    /// Absent secrets and wrong secrets are told apart so that
    /// misconfigured workers can be diagnosed from the status code.
    pub fn verify(&self, presented: Option<&str>) -> Result<(), IngressError> {
        let presented = presented.ok_or(IngressError::MissingSecret)?;
        if bool::from(presented.as_bytes().ct_eq(self.0.as_bytes())) {
            Ok(())
        } else {
            Err(IngressError::InvalidSecret)
        }
    }
}

impl std::fmt::Debug for WorkerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerSecret(..)")
    }
}

/// What happened to the follow-up summarization of an extracted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Queued(ItemHandle),
    Deferred(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngressReceipt {
    pub job: Job,
    pub chained: Option<ChainOutcome>,
}

#[derive(Clone)]
pub struct WebhookIngress {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
}

impl WebhookIngress {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_notifier(self, notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier, ..self }
    }

    /// Parses and applies a raw webhook body.
    pub async fn receive_bytes(&self, body: &[u8]) -> Result<IngressReceipt, IngressError> {
        let payload: WebhookPayload = serde_json::from_slice(body)?;
        self.receive(payload).await
    }

    pub async fn receive(&self, payload: WebhookPayload) -> Result<IngressReceipt, IngressError> {
        let update = payload.normalize()?;
        self.apply(update).await
    }

    #[instrument(skip_all, fields(job_id = %update.job_id, event))]
    pub async fn apply(&self, update: WebhookUpdate) -> Result<IngressReceipt, IngressError> {
        let job_id = update.job_id;
        if let Some(event) = &update.event {
            tracing::Span::current().record("event", tracing::field::display(event));
        }
        let cancelling = update.is_cancellation();
        let completes_extraction = update.completes_extraction();

        let Patched { job, outcome } = self
            .store
            .apply(job_id, update.into_patch(Utc::now()))
            .await?;

        if let Some(rejected) = outcome.rejected {
            tracing::warn!(
                from = %outcome.previous,
                to = %rejected,
                "Ignoring out of order status change"
            );
        }
        if cancelling {
            tracing::info!("Job cancelled by worker");
            return Ok(IngressReceipt { job, chained: None });
        }
        if outcome.status_changed && job.status == JobStatus::Completed {
            self.notify_completed(&job);
        }

        let chained = if completes_extraction && outcome.accepted && needs_summary(&job) {
            Some(self.chain_summarization(&job).await?)
        } else {
            None
        };

        let job = match chained {
            Some(_) => self
                .store
                .find(job_id, &crate::store::Scope::Any)
                .await?
                .unwrap_or(job),
            None => job,
        };
        Ok(IngressReceipt { job, chained })
    }

    async fn chain_summarization(&self, job: &Job) -> Result<ChainOutcome, IngressError> {
        let text = job.extracted_text.clone().unwrap_or_default();
        let now = Utc::now();
        let (patch, outcome) = match self
            .dispatcher
            .dispatch(&WorkItem::summarization(job.id, text))
            .await
        {
            Ok(handle) => {
                tracing::info!(%handle, "Queued summarization");
                let patch = JobPatch::new()
                    .append(TimelineEntry::new(TimelineEvent::SummarizationQueued, now))
                    .with_queue_ref(handle.to_string());
                (patch, ChainOutcome::Queued(handle))
            }
            Err(error) => {
                tracing::warn!(?error, "Summarization deferred, queue unavailable");
                let reason = deferral_reason(&error);
                let patch = JobPatch::new().append(
                    TimelineEntry::new(TimelineEvent::SummarizationDeferred, now)
                        .with_message(reason.clone()),
                );
                (patch, ChainOutcome::Deferred(reason))
            }
        };
        self.store.apply(job.id, patch).await?;
        Ok(outcome)
    }

    fn notify_completed(&self, job: &Job) {
        if job.notify_email.is_none() {
            return;
        }
        let notifier = self.notifier.clone();
        let job = job.clone();
        tokio::spawn(async move {
            if let Err(error) = notifier.job_completed(&job).await {
                tracing::warn!(job_id = %job.id, ?error, "Failed to send completion notification");
            }
        });
    }
}

fn needs_summary(job: &Job) -> bool {
    job.job_type.chains_summary()
        && job.status == JobStatus::Extracted
        && job.summary.is_none()
        && !job.has_event(&TimelineEvent::SummarizationQueued)
}

fn deferral_reason(error: &QueueError) -> String {
    match error {
        QueueError::Unavailable(reason) => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        assert_published,
        notifier::test::ChannelNotifier,
        queue::{memory::InMemoryQueue, Stage},
        store::{memory::InMemoryStore, NewJob, Scope},
    };

    struct Harness {
        store: Arc<InMemoryStore>,
        queue: InMemoryQueue,
        ingress: WebhookIngress,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let queue = InMemoryQueue::new();
            let ingress = WebhookIngress::new(store.clone(), Dispatcher::new(Arc::new(queue.clone())));
            Self {
                store,
                queue,
                ingress,
            }
        }

        async fn job(&self, new: NewJob) -> Job {
            self.store.create(new).await.unwrap()
        }

        async fn reload(&self, id: JobId) -> Job {
            self.store.find(id, &Scope::Any).await.unwrap().unwrap()
        }
    }

    fn events(job: &Job) -> Vec<TimelineEvent> {
        job.timeline.iter().map(|entry| entry.event.clone()).collect()
    }

    #[test]
    fn secret_distinguishes_missing_from_wrong() {
        let secret = WorkerSecret::new("s3cret");
        assert!(secret.verify(Some("s3cret")).is_ok());
        assert_matches!(secret.verify(None), Err(IngressError::MissingSecret));
        assert_matches!(secret.verify(Some("guess")), Err(IngressError::InvalidSecret));
        assert_matches!(secret.verify(Some("")), Err(IngressError::InvalidSecret));
        assert_eq!(format!("{secret:?}"), "WorkerSecret(..)");
    }

    #[tokio::test]
    async fn extraction_started_moves_to_processing() {
        let harness = Harness::new();
        let job = harness.job(NewJob::mock_job()).await;

        let receipt = harness
            .ingress
            .receive(WebhookPayload::event(job.id, TimelineEvent::ExtractionStarted))
            .await
            .unwrap();

        assert_eq!(receipt.job.status, JobStatus::Processing);
        assert_eq!(
            events(&harness.reload(job.id).await),
            vec![TimelineEvent::Queued, TimelineEvent::ExtractionStarted]
        );
    }

    #[tokio::test]
    async fn extraction_completed_chains_summarization_once() {
        let harness = Harness::new();
        let job = harness.job(NewJob::mock_job()).await;
        let completed = WebhookPayload::event(job.id, TimelineEvent::ExtractionCompleted)
            .with_extracted_text("ABC");

        let receipt = harness.ingress.receive(completed.clone()).await.unwrap();
        assert_matches!(receipt.chained, Some(ChainOutcome::Queued(_)));
        assert_eq!(receipt.job.status, JobStatus::Extracted);
        assert!(receipt.job.has_event(&TimelineEvent::SummarizationQueued));

        let redelivered = harness.ingress.receive(completed).await.unwrap();
        assert_eq!(redelivered.chained, None);

        assert_published!(to: harness.queue, stage: Stage::Summarization, job: job.id);
        let item = &harness.queue.pending(Stage::Summarization)[0];
        assert_eq!(item, &WorkItem::summarization(job.id, "ABC"));

        let stored = harness.reload(job.id).await;
        assert_eq!(stored.extracted_text.as_deref(), Some("ABC"));
        assert!(stored.queue_ref.is_some());
    }

    #[tokio::test]
    async fn ocr_only_job_completes_with_its_extraction() {
        let harness = Harness::new();
        let job = harness
            .job(NewJob::mock_job().with_job_type(crate::job::JobType::OcrOnly))
            .await;

        harness
            .ingress
            .receive(WebhookPayload::event(job.id, TimelineEvent::ExtractionStarted))
            .await
            .unwrap();
        let receipt = harness
            .ingress
            .receive(
                WebhookPayload::event(job.id, TimelineEvent::ExtractionCompleted)
                    .with_extracted_text("text"),
            )
            .await
            .unwrap();

        assert_eq!(receipt.chained, None);
        assert_eq!(receipt.job.status, JobStatus::Completed);
        assert_published!(0 items, to: harness.queue, stage: Stage::Summarization, job: job.id);

        let stored = harness.reload(job.id).await;
        assert_eq!(stored.extracted_text.as_deref(), Some("text"));
        assert_eq!(
            events(&stored),
            vec![
                TimelineEvent::Queued,
                TimelineEvent::ExtractionStarted,
                TimelineEvent::ExtractionCompleted
            ]
        );
        let view = crate::progress::ProgressView::project(
            &stored,
            stored.updated_at + chrono::TimeDelta::hours(5),
        );
        assert_eq!(view.progress, 100);
        assert_eq!(view.eta_seconds, None);
        assert_matches!(
            harness.store.request_cancel(job.id, &Scope::Any).await,
            Err(StoreError::AlreadyFinished { status: JobStatus::Completed, .. })
        );
    }

    #[tokio::test]
    async fn unavailable_queue_defers_chaining() {
        let store = Arc::new(InMemoryStore::new());
        let ingress = WebhookIngress::new(store.clone(), Dispatcher::disabled());
        let job = store.create(NewJob::mock_job()).await.unwrap();

        let receipt = ingress
            .receive(
                WebhookPayload::event(job.id, TimelineEvent::ExtractionCompleted)
                    .with_extracted_text("text"),
            )
            .await
            .unwrap();

        assert_matches!(receipt.chained, Some(ChainOutcome::Deferred(_)));
        assert_eq!(receipt.job.status, JobStatus::Extracted);
        assert!(receipt.job.has_event(&TimelineEvent::SummarizationDeferred));
    }

    #[tokio::test]
    async fn error_fails_job() {
        let harness = Harness::new();
        let job = harness.job(NewJob::mock_job()).await;

        let receipt = harness
            .ingress
            .receive(
                WebhookPayload::event(job.id, TimelineEvent::ExtractionStarted)
                    .with_error("OCR service unreachable"),
            )
            .await
            .unwrap();

        assert_eq!(receipt.job.status, JobStatus::Failed);
        assert_eq!(receipt.job.error.as_deref(), Some("OCR service unreachable"));
        assert_eq!(
            events(&receipt.job),
            vec![
                TimelineEvent::Queued,
                TimelineEvent::ExtractionStarted,
                TimelineEvent::JobFailed
            ]
        );
    }

    #[tokio::test]
    async fn late_updates_do_not_reopen_finished_jobs() {
        let harness = Harness::new();
        let job = harness.job(NewJob::mock_job()).await;
        harness
            .ingress
            .receive(WebhookPayload::event(job.id, TimelineEvent::JobCancelled))
            .await
            .unwrap();

        let receipt = harness
            .ingress
            .receive(
                WebhookPayload::event(job.id, TimelineEvent::ExtractionCompleted)
                    .with_extracted_text("late"),
            )
            .await
            .unwrap();

        assert_eq!(receipt.job.status, JobStatus::Cancelled);
        assert_eq!(receipt.job.extracted_text, None);
        assert_eq!(receipt.chained, None);
        assert!(receipt.job.has_event(&TimelineEvent::ExtractionCompleted));
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let harness = Harness::new();
        let id = JobId::new();
        assert_matches!(
            harness
                .ingress
                .receive(WebhookPayload::event(id, TimelineEvent::ExtractionStarted))
                .await,
            Err(IngressError::JobNotFound(missing)) if missing == id
        );
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let harness = Harness::new();
        assert_matches!(
            harness.ingress.receive_bytes(b"{not json").await,
            Err(IngressError::MalformedPayload(_))
        );
        let body = serde_json::to_vec(&json!({ "event": "extraction_started" })).unwrap();
        assert_matches!(
            harness.ingress.receive_bytes(&body).await,
            Err(IngressError::MissingJobId)
        );
    }

    #[tokio::test]
    async fn completion_notifies_owner() {
        let store = Arc::new(InMemoryStore::new());
        let (notifier, mut notifications) = ChannelNotifier::new();
        let ingress = WebhookIngress::new(store.clone(), Dispatcher::disabled())
            .with_notifier(Arc::new(notifier));
        let mut new = NewJob::mock_job().with_job_type(crate::job::JobType::Summarize);
        new.notify_email = Some("owner@example.com".to_owned());
        let job = store.create(new).await.unwrap();

        let completed = WebhookPayload::event(job.id, TimelineEvent::SummarizationCompleted)
            .with_summary("- one\n- two");
        ingress.receive(completed.clone()).await.unwrap();
        ingress.receive(completed).await.unwrap();

        let notified = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notified.id, job.id);
        assert_eq!(notified.summary.as_deref(), Some("- one\n- two"));

        let again = tokio::time::timeout(Duration::from_millis(100), notifications.recv()).await;
        assert!(again.is_err(), "duplicate delivery must not notify twice");
    }
}
