//! Notifications sent when a job finishes successfully.
use async_trait::async_trait;
use thiserror::Error;

use crate::job::Job;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to deliver notification: {0}")]
    Delivery(String),
}

/// Delivers a completion message to a job's owner.
///
/// Invoked at most once per job, in the background, after the job reached
/// `completed`. Failures are logged and never affect the job record.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn job_completed(&self, job: &Job) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn job_completed(&self, job: &Job) -> Result<(), NotifyError> {
        tracing::info!(
            job_id = %job.id,
            recipient = job.notify_email.as_deref().unwrap_or_default(),
            summary_len = job.summary.as_deref().map_or(0, str::len),
            "Job completed notification"
        );
        Ok(())
    }
}
