use std::{sync::Arc, time::Duration};

use async_stream::stream;
use chrono::Utc;
use futures::Stream;
use serde_json::{json, Value};
use tokio::{
    sync::broadcast::error::RecvError,
    time::MissedTickBehavior,
};

use super::ProgressView;
use crate::{
    job::{Job, JobId, JobStatus},
    store::{JobStore, Scope},
};

/// Event pushed to a progress subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected { job_id: JobId },
    Progress(ProgressView),
    Completed(ProgressView),
    Cancelled(ProgressView),
    Error {
        message: String,
        view: Option<ProgressView>,
    },
}

impl StreamEvent {
    fn from_job(job: &Job) -> Self {
        let view = ProgressView::project(job, Utc::now());
        match job.status {
            JobStatus::Cancelled => Self::Cancelled(view),
            JobStatus::Failed => Self::Error {
                message: job
                    .error
                    .clone()
                    .unwrap_or_else(|| "Job failed".to_owned()),
                view: Some(view),
            },
            _ if view.progress >= 100 => Self::Completed(view),
            _ => Self::Progress(view),
        }
    }

    /// Name of the server-sent event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Progress(_) => "progress",
            Self::Completed(_) => "completed",
            Self::Cancelled(_) => "cancelled",
            Self::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::Connected { job_id } => json!({ "jobId": job_id }),
            Self::Progress(view) | Self::Completed(view) | Self::Cancelled(view) => {
                serde_json::to_value(view).unwrap_or(Value::Null)
            }
            Self::Error { message, view } => json!({ "message": message, "progress": view }),
        }
    }

    /// Whether the stream ends after this event.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Connected { .. } | Self::Progress(_))
    }
}

/// Live progress of a single job.
///
/// Emits `connected` once, then a progress event on every tick and whenever
/// the store reports a change to the job. The stream finishes after the
/// first `completed`, `cancelled` or `error` event.
pub struct ProgressStream {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    scope: Scope,
    interval: Duration,
}

impl ProgressStream {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

    pub fn new(store: Arc<dyn JobStore>, job_id: JobId, scope: Scope) -> Self {
        Self {
            store,
            job_id,
            scope,
            interval: Self::DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let Self {
            store,
            job_id,
            scope,
            interval,
        } = self;
        stream! {
            let mut changes = store.subscribe_changes();
            let mut changes_open = true;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            yield StreamEvent::Connected { job_id };

            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    changed = changes.recv(), if changes_open => match changed {
                        Ok(id) if id != job_id => continue,
                        Ok(_) | Err(RecvError::Lagged(_)) => {},
                        Err(RecvError::Closed) => {
                            changes_open = false;
                            continue;
                        }
                    },
                }

                let event = match store.find(job_id, &scope).await {
                    Ok(Some(job)) => StreamEvent::from_job(&job),
                    Ok(None) => StreamEvent::Error {
                        message: "Job not found".to_owned(),
                        view: None,
                    },
                    Err(error) => {
                        tracing::warn!(%job_id, ?error, "Failed to load job for progress stream");
                        StreamEvent::Error {
                            message: error.to_string(),
                            view: None,
                        }
                    }
                };
                let finished = event.is_final();
                yield event;
                if finished {
                    tracing::debug!(%job_id, "Progress stream finished");
                    break;
                }
            }
        }
    }
}
