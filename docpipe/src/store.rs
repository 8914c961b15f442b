//! Durable storage of job records.
//!
//! A [`JobStore`] is the single source of truth for a job's status and
//! timeline. Every mutation goes through [`JobStore::apply`] so the
//! monotonic status rule of [`Job::apply_patch`] holds for all backends.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::job::{
    Job, JobId, JobPatch, JobStatus, JobType, PatchOutcome, TimelineEntry, TimelineEvent, UserId,
};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// Upper bound on a single listing page.
pub const MAX_PAGE_SIZE: u64 = 50;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job with status `queued` and a single `queued` entry.
    async fn create(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn find(&self, id: JobId, scope: &Scope) -> Result<Option<Job>, StoreError>;

    /// Jobs matching the filter, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Number of matching jobs ignoring pagination.
    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError>;

    /// Applies the patch atomically with respect to other writers.
    async fn apply(&self, id: JobId, patch: JobPatch) -> Result<Patched, StoreError>;

    async fn request_cancel(&self, id: JobId, scope: &Scope) -> Result<Job, StoreError>;

    /// Ids of jobs as they change, for waking up progress streams early.
    fn subscribe_changes(&self) -> broadcast::Receiver<JobId>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Job {id} has already finished with status {status}")]
    AlreadyFinished { id: JobId, status: JobStatus },
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Store in bad state")]
    BadState,
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Everything needed to create a job record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub user: UserId,
    pub job_type: JobType,
    pub file_url: Option<String>,
    pub extracted_text: Option<String>,
    pub notify_email: Option<String>,
}

impl NewJob {
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            user: self.user,
            job_type: self.job_type,
            file_url: self.file_url,
            status: JobStatus::Queued,
            timeline: vec![TimelineEntry::new(TimelineEvent::Queued, now)],
            extracted_text: self.extracted_text,
            summary: None,
            processed_url: None,
            error: None,
            stage_progress: None,
            cancel_requested: false,
            queue_ref: None,
            notify_email: self.notify_email,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Patched {
    pub job: Job,
    pub outcome: PatchOutcome,
}

/// Which jobs a caller may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Any,
    Owner(UserId),
}

impl Scope {
    pub fn permits(&self, job: &Job) -> bool {
        match self {
            Self::Any => true,
            Self::Owner(user) => &job.user == user,
        }
    }

    pub fn owner(&self) -> Option<&UserId> {
        match self {
            Self::Any => None,
            Self::Owner(user) => Some(user),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobFilter {
    pub scope: Scope,
    pub statuses: Vec<JobStatus>,
    pub updated_before: Option<DateTime<Utc>>,
    pub skip: u64,
    pub limit: u64,
}

impl JobFilter {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            statuses: Vec::new(),
            updated_before: None,
            skip: 0,
            limit: MAX_PAGE_SIZE,
        }
    }

    pub fn with_statuses(self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..self
        }
    }

    pub fn updated_before(self, time: DateTime<Utc>) -> Self {
        Self {
            updated_before: Some(time),
            ..self
        }
    }

    pub fn paginate(self, skip: u64, limit: u64) -> Self {
        Self {
            skip,
            limit: limit.min(MAX_PAGE_SIZE),
            ..self
        }
    }

    /// Whether the job matches, ignoring pagination.
    pub fn matches(&self, job: &Job) -> bool {
        self.scope.permits(job)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self
                .updated_before
                .map_or(true, |before| job.updated_at < before)
    }
}
