//! Fails jobs whose worker went silent.
//!
//! A job only leaves `processing` or `summarizing` when a worker reports
//! back. If the worker dies after acknowledging its item, nothing else would
//! ever move the job on. The sweeper runs on a [`cron::Schedule`] and marks
//! every job stuck in a running state for longer than the configured age as
//! failed.
//!
//! ```
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! # use docpipe::sweeper::SweeperConfig;
//! let config = SweeperConfig::new(cron::Schedule::from_str("0 */5 * * * *").unwrap())
//!     .with_max_age(TimeDelta::minutes(30));
//! ```
use std::{ops::Sub, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    job::{JobPatch, JobStatus, TimelineEntry, TimelineEvent},
    store::{JobFilter, JobStore, Scope, StoreError, MAX_PAGE_SIZE},
};

pub const STAGE_DEADLINE_EXCEEDED: &str = "stage deadline exceeded";

const RUNNING: [JobStatus; 2] = [JobStatus::Processing, JobStatus::Summarizing];

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    schedule: cron::Schedule,
    max_age: TimeDelta,
}

impl SweeperConfig {
    pub const DEFAULT_MAX_AGE: TimeDelta = TimeDelta::minutes(30);

    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            max_age: Self::DEFAULT_MAX_AGE,
        }
    }

    /// How long a job may go without an update while running.
    pub fn with_max_age(self, max_age: TimeDelta) -> Self {
        Self { max_age, ..self }
    }
}

pub struct Sweeper {
    store: Arc<dyn JobStore>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(store: Arc<dyn JobStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                    tracing::warn!("No upcoming run for the job sweeper, stopping");
                    break;
                };
                let delay = next.sub(Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let _ = self.sweep().await.inspect_err(|error| {
                            tracing::error!(?error, "Job sweep failed");
                        });
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the job sweeper");
                        break;
                    }
                }
            }
        })
    }

    /// Fails every stale running job, returning how many were failed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - self.config.max_age;
        let filter = JobFilter::new(Scope::Any)
            .with_statuses(RUNNING)
            .updated_before(cutoff)
            .paginate(0, MAX_PAGE_SIZE);

        let mut failed = 0;
        loop {
            let stale = self.store.list(&filter).await?;
            let batch = stale.len();
            let mut progressed = false;
            for job in stale {
                let patch = JobPatch::new()
                    .append(
                        TimelineEntry::new(TimelineEvent::JobFailed, Utc::now())
                            .with_message(STAGE_DEADLINE_EXCEEDED),
                    )
                    .with_status(JobStatus::Failed)
                    .with_error(STAGE_DEADLINE_EXCEEDED);
                match self.store.apply(job.id, patch).await {
                    Ok(patched) if patched.outcome.status_changed => {
                        tracing::warn!(job_id = %job.id, last_update = %job.updated_at, "Failed stale job");
                        failed += 1;
                        progressed = true;
                    }
                    Ok(_) | Err(StoreError::JobNotFound(_)) => {}
                    Err(error) => return Err(error),
                }
            }
            if (batch as u64) < MAX_PAGE_SIZE || !progressed {
                break;
            }
        }
        if failed > 0 {
            tracing::info!(failed, "Job sweep complete");
        }
        Ok(failed)
    }
}
