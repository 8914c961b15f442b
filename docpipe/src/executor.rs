//! Execution of a single stage of a job.
//!
//! The [`StageExecutor`] drives the external capabilities ([`Extractor`] and
//! [`Summarizer`]) and reports every step of its progress through a
//! [`Reporter`]. It never touches the job store itself.
use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    ingress::WebhookPayload,
    job::{JobId, TimelineEvent},
    queue::{StagePayload, WorkItem},
    reporter::{ReportError, Reporter},
};

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{0}")]
    Failed(String),
    #[error("Cancelled while in progress")]
    Cancelled,
}

/// What the capability should do after reporting progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Cancel,
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Reports progress of the running stage as a percentage.
    async fn progress(&self, percent: u8) -> Tick;
}

/// Turns a document into text.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        file_url: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, CapabilityError>;
}

/// Condenses text into a short summary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, CapabilityError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Done,
    Cancelled,
    Failed { error: String },
}

const NO_TEXT_EXTRACTED: &str = "No text extracted";
const NOTHING_TO_SUMMARIZE: &str = "No text to summarize";

pub struct StageExecutor {
    reporter: Arc<dyn Reporter>,
    extractor: Arc<dyn Extractor>,
    summarizer: Arc<dyn Summarizer>,
    stage_timeout: Option<Duration>,
}

impl StageExecutor {
    pub fn new(
        reporter: Arc<dyn Reporter>,
        extractor: Arc<dyn Extractor>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            reporter,
            extractor,
            summarizer,
            stage_timeout: None,
        }
    }

    /// Fail a stage whose capability call runs longer than `timeout`.
    pub fn with_stage_timeout(self, timeout: Duration) -> Self {
        Self {
            stage_timeout: Some(timeout),
            ..self
        }
    }

    /// Runs one work item to completion.
    ///
    /// Returns an error only when an update could not be delivered, in which
    /// case the item should be handed back to the queue. Failures of the
    /// stage itself are reported to the API and returned as
    /// [`ExecutionResult::Failed`].
    #[instrument(skip(self, item), fields(job_id = %item.job_id, stage = %item.stage()))]
    pub async fn execute(&self, item: &WorkItem) -> Result<ExecutionResult, ReportError> {
        match &item.payload {
            StagePayload::Extract { file_url } => self.extract(item.job_id, file_url).await,
            StagePayload::Summarize { text } => self.summarize(item.job_id, text).await,
        }
    }

    async fn extract(&self, job_id: JobId, file_url: &str) -> Result<ExecutionResult, ReportError> {
        self.report(WebhookPayload::event(job_id, TimelineEvent::ExtractionStarted))
            .await?;
        if self.cancellation_requested(job_id).await {
            return self.cancelled(job_id).await;
        }

        let extractor = self.extractor.clone();
        let sink = ReportingSink {
            job_id,
            reporter: self.reporter.clone(),
        };
        let file_url = file_url.to_owned();
        let outcome = self
            .run_capability(async move { extractor.extract(&file_url, &sink).await })
            .await;

        match outcome {
            Ok(text) if !text.trim().is_empty() => {
                tracing::debug!(chars = text.len(), "Extraction complete");
                self.report(
                    WebhookPayload::event(job_id, TimelineEvent::ExtractionCompleted)
                        .with_extracted_text(text),
                )
                .await?;
                Ok(ExecutionResult::Done)
            }
            Ok(_) => self.failed(job_id, NO_TEXT_EXTRACTED).await,
            Err(CapabilityError::Cancelled) => self.cancelled(job_id).await,
            Err(CapabilityError::Failed(error)) => self.failed(job_id, error).await,
        }
    }

    async fn summarize(&self, job_id: JobId, text: &str) -> Result<ExecutionResult, ReportError> {
        if text.trim().is_empty() {
            return self.failed(job_id, NOTHING_TO_SUMMARIZE).await;
        }
        self.report(WebhookPayload::event(job_id, TimelineEvent::SummarizationStarted))
            .await?;
        if self.cancellation_requested(job_id).await {
            return self.cancelled(job_id).await;
        }

        let summarizer = self.summarizer.clone();
        let text = text.to_owned();
        let outcome = self
            .run_capability(async move { summarizer.summarize(&text).await })
            .await;

        match outcome {
            Ok(summary) if !summary.trim().is_empty() => {
                self.report(
                    WebhookPayload::event(job_id, TimelineEvent::SummarizationCompleted)
                        .with_summary(summary),
                )
                .await?;
                Ok(ExecutionResult::Done)
            }
            Ok(_) => self.failed(job_id, "Summarizer returned an empty summary").await,
            Err(CapabilityError::Cancelled) => self.cancelled(job_id).await,
            Err(CapabilityError::Failed(error)) => self.failed(job_id, error).await,
        }
    }

    /// Runs the capability on its own task so a panic fails the stage rather
    /// than the worker.
    async fn run_capability<F>(&self, capability: F) -> Result<String, CapabilityError>
    where
        F: Future<Output = Result<String, CapabilityError>> + Send + 'static,
    {
        let mut handle = tokio::spawn(capability.in_current_span());
        let joined = match self.stage_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(joined) => joined,
                Err(_elapsed) => {
                    handle.abort();
                    return Err(StageFailure::from(timeout).into());
                }
            },
            None => handle.await,
        };
        joined.map_err(|error| CapabilityError::from(StageFailure::from(error)))?
    }

    async fn cancellation_requested(&self, job_id: JobId) -> bool {
        self.reporter
            .should_cancel(job_id)
            .await
            .inspect_err(|error| {
                tracing::warn!(?error, "Cancellation check failed, continuing");
            })
            .unwrap_or(false)
    }

    async fn cancelled(&self, job_id: JobId) -> Result<ExecutionResult, ReportError> {
        tracing::info!("Stage cancelled on request");
        self.report(
            WebhookPayload::event(job_id, TimelineEvent::JobCancelled)
                .with_message("Cancelled by user"),
        )
        .await?;
        Ok(ExecutionResult::Cancelled)
    }

    async fn failed(
        &self,
        job_id: JobId,
        error: impl Into<String>,
    ) -> Result<ExecutionResult, ReportError> {
        let error = error.into();
        tracing::warn!(%error, "Stage failed");
        self.report(WebhookPayload::event(job_id, TimelineEvent::JobFailed).with_error(error.clone()))
            .await?;
        Ok(ExecutionResult::Failed { error })
    }

    async fn report(&self, payload: WebhookPayload) -> Result<(), ReportError> {
        self.reporter.report(&payload).await.inspect_err(|error| {
            tracing::error!(?error, event = ?payload.event, "Failed to report status update")
        })
    }
}

struct ReportingSink {
    job_id: JobId,
    reporter: Arc<dyn Reporter>,
}

#[async_trait]
impl ProgressSink for ReportingSink {
    async fn progress(&self, percent: u8) -> Tick {
        let payload =
            WebhookPayload::event(self.job_id, TimelineEvent::OcrProgress).with_progress(percent);
        if let Err(error) = self.reporter.report(&payload).await {
            tracing::warn!(?error, percent, "Failed to report progress");
        }
        match self.reporter.should_cancel(self.job_id).await {
            Ok(true) => Tick::Cancel,
            Ok(false) => Tick::Continue,
            Err(error) => {
                tracing::warn!(?error, "Cancellation check failed, continuing");
                Tick::Continue
            }
        }
    }
}

/// Abnormal endings of a capability call.
#[derive(Debug)]
struct StageFailure(String);

impl From<JoinError> for StageFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self(format!("Stage panicked: {message}"))
    }
}

impl From<Duration> for StageFailure {
    fn from(value: Duration) -> Self {
        Self(format!("Stage failed to complete within timeout: {value:?}"))
    }
}

impl From<StageFailure> for CapabilityError {
    fn from(value: StageFailure) -> Self {
        Self::Failed(value.0)
    }
}
