use async_trait::async_trait;
use docpipe::{
    job::Job,
    notifier::{Notifier, NotifyError},
};
use serde::Serialize;

/// Hands completion notifications to an HTTP mail relay.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct Notification<'a> {
    to: &'a str,
    subject: String,
    summary: &'a str,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn job_completed(&self, job: &Job) -> Result<(), NotifyError> {
        let Some(to) = job.notify_email.as_deref() else {
            tracing::debug!(job_id = %job.id, "No recipient for completion notification");
            return Ok(());
        };
        self.client
            .post(&self.url)
            .json(&Notification {
                to,
                subject: format!("Your document is ready ({})", job.job_type),
                summary: job.summary.as_deref().unwrap_or_default(),
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| NotifyError::Delivery(error.to_string()))?;
        Ok(())
    }
}
