//! How workers talk back to the API.
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    ingress::{IngressError, WebhookIngress, WebhookPayload},
    job::JobId,
    store::{JobStore, Scope},
};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Update rejected: {0}")]
    Rejected(String),
    #[error("Failed to reach the API: {0}")]
    Transport(String),
}

/// Channel from a worker to the webhook ingress.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Delivers one status update.
    async fn report(&self, payload: &WebhookPayload) -> Result<(), ReportError>;

    /// Whether the job's owner asked to stop it.
    async fn should_cancel(&self, job_id: JobId) -> Result<bool, ReportError>;
}

/// Reports straight into an ingress in the same process.
#[derive(Clone)]
pub struct LocalReporter {
    ingress: WebhookIngress,
    store: Arc<dyn JobStore>,
}

impl LocalReporter {
    pub fn new(ingress: WebhookIngress, store: Arc<dyn JobStore>) -> Self {
        Self { ingress, store }
    }
}

#[async_trait]
impl Reporter for LocalReporter {
    async fn report(&self, payload: &WebhookPayload) -> Result<(), ReportError> {
        self.ingress
            .receive(payload.clone())
            .await
            .map(|_| ())
            .map_err(|error| match error {
                IngressError::JobNotFound(id) => ReportError::JobNotFound(id),
                IngressError::Store(error) => ReportError::Transport(error.to_string()),
                other => ReportError::Rejected(other.to_string()),
            })
    }

    async fn should_cancel(&self, job_id: JobId) -> Result<bool, ReportError> {
        self.store
            .find(job_id, &Scope::Any)
            .await
            .map_err(|error| ReportError::Transport(error.to_string()))?
            .map(|job| job.should_cancel())
            .ok_or(ReportError::JobNotFound(job_id))
    }
}
