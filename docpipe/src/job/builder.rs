use chrono::Utc;

use crate::{
    job::{Job, JobPatch, JobType, TimelineEntry, TimelineEvent, UserId},
    queue::{Dispatcher, ItemHandle, QueueError, StagePayload, WorkItem},
    store::{JobStore, NewJob},
    DocpipeError,
};

/// Creates a job record and hands its first stage to the queue.
///
/// The record is always persisted before anything is published, so a worker
/// can never receive work for a job that does not exist. When the queue is
/// down the job is still accepted and the deferral noted on its timeline.
///
/// ```
/// # use std::sync::Arc;
/// # use docpipe::prelude::*;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = InMemoryStore::new();
/// let queue = InMemoryQueue::new();
/// let dispatcher = Dispatcher::new(Arc::new(queue.clone()));
///
/// let enqueued = JobBuilder::extract_text()
///     .owned_by("user-1")
///     .with_file_url("https://files.example.com/scan.pdf")
///     .enqueue(&store, &dispatcher)
///     .await
///     .unwrap();
///
/// assert!(!enqueued.is_deferred());
/// assert_eq!(enqueued.job().status, JobStatus::Queued);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    job_type: JobType,
    user: Option<UserId>,
    file_url: Option<String>,
    text: Option<String>,
    notify_email: Option<String>,
}

#[derive(Debug)]
pub enum Enqueued {
    Published { job: Job, handle: ItemHandle },
    Deferred { job: Job, reason: QueueError },
}

impl Enqueued {
    pub fn job(&self) -> &Job {
        match self {
            Self::Published { job, .. } | Self::Deferred { job, .. } => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Self::Published { job, .. } | Self::Deferred { job, .. } => job,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}

impl JobBuilder {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            user: None,
            file_url: None,
            text: None,
            notify_email: None,
        }
    }

    pub fn extract_text() -> Self {
        Self::new(JobType::ExtractText)
    }

    pub fn ocr_only() -> Self {
        Self::new(JobType::OcrOnly)
    }

    pub fn summarize() -> Self {
        Self::new(JobType::Summarize)
    }

    pub fn owned_by(self, user: impl Into<UserId>) -> Self {
        Self {
            user: Some(user.into()),
            ..self
        }
    }

    pub fn with_file_url(self, file_url: impl Into<String>) -> Self {
        Self {
            file_url: Some(file_url.into()),
            ..self
        }
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..self
        }
    }

    pub fn notify(self, email: Option<String>) -> Self {
        Self {
            notify_email: email,
            ..self
        }
    }

    fn build(self) -> Result<(NewJob, StagePayload), DocpipeError> {
        let user = self
            .user
            .ok_or_else(|| DocpipeError::Validation("an owner is required".to_owned()))?;
        let built = match self.job_type {
            JobType::ExtractText | JobType::OcrOnly => {
                let file_url = self
                    .file_url
                    .map(|url| url.trim().to_owned())
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| DocpipeError::Validation("fileUrl is required".to_owned()))?;
                (
                    NewJob {
                        user,
                        job_type: self.job_type,
                        file_url: Some(file_url.clone()),
                        extracted_text: None,
                        notify_email: self.notify_email,
                    },
                    StagePayload::Extract { file_url },
                )
            }
            JobType::Summarize => {
                let text = self
                    .text
                    .filter(|text| !text.trim().is_empty())
                    .ok_or_else(|| DocpipeError::Validation("text is required".to_owned()))?;
                (
                    NewJob {
                        user,
                        job_type: self.job_type,
                        file_url: self.file_url,
                        extracted_text: Some(text.clone()),
                        notify_email: self.notify_email,
                    },
                    StagePayload::Summarize { text },
                )
            }
        };
        Ok(built)
    }

    #[tracing::instrument(skip_all, fields(job_type = %self.job_type))]
    pub async fn enqueue(
        self,
        store: &dyn JobStore,
        dispatcher: &Dispatcher,
    ) -> Result<Enqueued, DocpipeError> {
        let (new_job, payload) = self.build()?;
        let job = store.create(new_job).await?;
        let item = WorkItem {
            job_id: job.id,
            payload,
        };

        match dispatcher.dispatch(&item).await {
            Ok(handle) => {
                let job = store
                    .apply(job.id, JobPatch::new().with_queue_ref(handle.to_string()))
                    .await?
                    .job;
                tracing::info!(job_id = %job.id, %handle, "Job enqueued");
                Ok(Enqueued::Published { job, handle })
            }
            Err(reason) => {
                tracing::warn!(job_id = %job.id, ?reason, "Job accepted but not queued");
                let entry = TimelineEntry::new(TimelineEvent::EnqueueDeferred, Utc::now())
                    .with_message(reason.to_string());
                let job = store.apply(job.id, JobPatch::new().append(entry)).await?.job;
                Ok(Enqueued::Deferred { job, reason })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        assert_published,
        job::JobStatus,
        queue::{memory::InMemoryQueue, Stage},
        store::{memory::InMemoryStore, Scope},
    };

    #[tokio::test]
    async fn extract_text_job_is_stored_then_published() {
        let store = InMemoryStore::new();
        let queue = InMemoryQueue::new();
        let dispatcher = Dispatcher::new(Arc::new(queue.clone()));

        let enqueued = JobBuilder::extract_text()
            .owned_by("user-1")
            .with_file_url(" https://files.example.com/scan.pdf ")
            .enqueue(&store, &dispatcher)
            .await
            .unwrap();

        let job = enqueued.job();
        assert_matches!(&enqueued, Enqueued::Published { handle, .. } if job.queue_ref.as_deref() == Some(handle.as_str()));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.file_url.as_deref(), Some("https://files.example.com/scan.pdf"));

        assert_published!(to: queue, stage: Stage::Extraction, job: job.id);
        let stored = store.find(job.id, &Scope::Any).await.unwrap().unwrap();
        assert_eq!(stored.queue_ref, job.queue_ref);
    }

    #[tokio::test]
    async fn summarize_job_goes_to_summarization() {
        let store = InMemoryStore::new();
        let queue = InMemoryQueue::new();
        let dispatcher = Dispatcher::new(Arc::new(queue.clone()));

        let job = JobBuilder::summarize()
            .owned_by("user-1")
            .with_text("Some long text to summarize")
            .enqueue(&store, &dispatcher)
            .await
            .unwrap()
            .into_job();

        assert_eq!(job.extracted_text.as_deref(), Some("Some long text to summarize"));
        assert_published!(to: queue, stage: Stage::Summarization, job: job.id);
        assert_published!(0 items, to: queue, stage: Stage::Extraction, job: job.id);
    }

    #[tokio::test]
    async fn unavailable_queue_still_accepts_job() {
        let store = InMemoryStore::new();
        let queue = InMemoryQueue::new().unavailable();
        let dispatcher = Dispatcher::new(Arc::new(queue.clone()));

        let enqueued = JobBuilder::ocr_only()
            .owned_by("user-1")
            .with_file_url("https://files.example.com/scan.pdf")
            .enqueue(&store, &dispatcher)
            .await
            .unwrap();

        assert!(enqueued.is_deferred());
        let job = enqueued.job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.has_event(&TimelineEvent::EnqueueDeferred));
        assert!(store.find(job.id, &Scope::Any).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_requests_create_nothing() {
        let store = InMemoryStore::new();
        let dispatcher = Dispatcher::disabled();

        assert_matches!(
            JobBuilder::extract_text()
                .owned_by("user-1")
                .with_file_url("   ")
                .enqueue(&store, &dispatcher)
                .await,
            Err(DocpipeError::Validation(_))
        );
        assert_matches!(
            JobBuilder::summarize()
                .owned_by("user-1")
                .enqueue(&store, &dispatcher)
                .await,
            Err(DocpipeError::Validation(_))
        );
        assert_matches!(
            JobBuilder::extract_text()
                .with_file_url("https://x/y.pdf")
                .enqueue(&store, &dispatcher)
                .await,
            Err(DocpipeError::Validation(_))
        );
        assert_eq!(
            store
                .count(&crate::store::JobFilter::new(Scope::Any))
                .await
                .unwrap(),
            0
        );
    }
}
