//! Provides an in memory implementation of [`JobStore`].
//!
//! It is designed to be a correct implementation for use in tests and local development, not an
//! optimized one.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use super::{JobFilter, JobStore, NewJob, Patched, Scope, StoreError};
use crate::job::{Job, JobId, JobPatch};

const CHANGE_CAPACITY: usize = 1024;

/// An in memory implementation of [`JobStore`].
///
/// **This is not designed for use in a production system**, records are lost on restart.
#[derive(Clone)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    changes: broadcast::Sender<JobId>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            jobs: Default::default(),
            changes,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish_change(&self, id: JobId) {
        // No subscribers is fine.
        let _ = self.changes.send(id);
    }

    fn matching(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = job.into_job(JobId::new(), Utc::now());
        self.jobs
            .write()
            .map_err(|_| StoreError::BadState)?
            .insert(job.id, job.clone());
        self.publish_change(job.id);
        Ok(job)
    }

    async fn find(&self, id: JobId, scope: &Scope) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(&id)
            .filter(|job| scope.permits(job))
            .cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .matching(filter)?
            .into_iter()
            .skip(filter.skip as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        Ok(self.matching(filter)?.len() as u64)
    }

    async fn apply(&self, id: JobId, patch: JobPatch) -> Result<Patched, StoreError> {
        let patched = {
            let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
            let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
            let outcome = job.apply_patch(patch, Utc::now());
            Patched {
                job: job.clone(),
                outcome,
            }
        };
        self.publish_change(id);
        Ok(patched)
    }

    async fn request_cancel(&self, id: JobId, scope: &Scope) -> Result<Job, StoreError> {
        let job = {
            let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
            let job = jobs
                .get_mut(&id)
                .filter(|job| scope.permits(job))
                .ok_or(StoreError::JobNotFound(id))?;
            job.request_cancel(Utc::now())
                .map_err(|status| StoreError::AlreadyFinished { id, status })?;
            job.clone()
        };
        self.publish_change(id);
        Ok(job)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<JobId> {
        self.changes.subscribe()
    }
}
