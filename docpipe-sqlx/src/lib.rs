//! A Postgres implementation of [`docpipe::store::JobStore`].
//!
//! Jobs live in a single `docpipe_jobs` table with the timeline held as a `jsonb` array. Every
//! patch is applied inside a transaction holding the row lock, so the status rules of
//! [`docpipe::job::Job::apply_patch`] hold across any number of API and worker processes.
//! Changes made by other processes reach [`JobStore::subscribe_changes`] through
//! `LISTEN/NOTIFY`.
use async_trait::async_trait;
use chrono::Utc;
use docpipe::{
    job::{Job, JobId, JobPatch},
    store::{JobFilter, JobStore, NewJob, Patched, Scope, StoreError},
};
use sqlx::{postgres::PgListener, PgPool, Postgres, Transaction};
use tokio::sync::broadcast;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    query::ToQuery,
    types::{JobRow, JobStatus, COLUMNS},
};

mod query;
mod types;

const CHANGE_CHANNEL: &str = "docpipe_job_changed";
const CHANGE_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct DocpipePgStore {
    pool: PgPool,
    changes: broadcast::Sender<JobId>,
}

#[derive(Debug, thiserror::Error)]
pub enum PgStoreError {
    #[error("Failed to run migrations")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Failed to listen for job changes")]
    Listen(#[from] sqlx::Error),
}

impl DocpipePgStore {
    /// Runs the pending migrations and starts relaying change notifications.
    pub async fn from_pool(pool: PgPool) -> Result<Self, PgStoreError> {
        sqlx::migrate!().run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let this = Self { pool, changes };
        this.listen().await?;
        Ok(this)
    }

    async fn listen(&self) -> Result<(), PgStoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        tokio::spawn({
            let changes = self.changes.clone();
            async move {
                loop {
                    match listener.recv().await {
                        Ok(notification) => match notification.payload().parse::<JobId>() {
                            Ok(id) => {
                                let _ = changes.send(id);
                            }
                            Err(error) => {
                                tracing::warn!(
                                    ?error,
                                    payload = notification.payload(),
                                    "Ignoring malformed job change notification"
                                );
                            }
                        },
                        Err(error) => {
                            tracing::error!(?error, "Job change listener stopped");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn publish_change(&self, id: JobId) {
        let _ = self.changes.send(id);
    }

    async fn insert(&self, job: &Job) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO docpipe_jobs (
                id,
                user_id,
                job_type,
                file_url,
                status,
                timeline,
                extracted_text,
                notify_email,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(Uuid::from(job.id))
        .bind(job.user.as_str())
        .bind(job.job_type.as_str())
        .bind(job.file_url.as_deref())
        .bind(JobStatus::from(job.status))
        .bind(sqlx::types::Json(&job.timeline))
        .bind(job.extracted_text.as_deref())
        .bind(job.notify_email.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
    ) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {COLUMNS} FROM docpipe_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_err)?
        .map(Job::try_from)
        .transpose()
    }

    async fn write(tx: &mut Transaction<'_, Postgres>, job: &Job) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE docpipe_jobs SET
                status = $2,
                timeline = $3,
                extracted_text = $4,
                summary = $5,
                processed_url = $6,
                error = $7,
                stage_progress = $8,
                cancel_requested = $9,
                queue_ref = $10,
                updated_at = $11
            WHERE id = $1"#,
        )
        .bind(Uuid::from(job.id))
        .bind(JobStatus::from(job.status))
        .bind(sqlx::types::Json(&job.timeline))
        .bind(job.extracted_text.as_deref())
        .bind(job.summary.as_deref())
        .bind(job.processed_url.as_deref())
        .bind(job.error.as_deref())
        .bind(job.stage_progress.map(i16::from))
        .bind(job.cancel_requested)
        .bind(job.queue_ref.as_deref())
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await?
        .rows_affected())
    }

    /// Locks the row, lets `change` modify the job and writes it back.
    async fn modify<T: Send>(
        &self,
        id: JobId,
        change: impl FnOnce(&mut Job) -> Result<T, StoreError> + Send,
    ) -> Result<(Job, T), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let mut job = Self::lock(&mut tx, id)
            .await?
            .ok_or(StoreError::JobNotFound(id))?;
        let result = change(&mut job)?;
        match Self::write(&mut tx, &job).await.map_err(map_err)? {
            1 => {}
            0 => return Err(StoreError::JobNotFound(id)),
            _ => return Err(StoreError::BadState),
        }
        tx.commit().await.map_err(map_err)?;
        self.publish_change(id);
        Ok((job, result))
    }
}

impl std::ops::Deref for DocpipePgStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

#[async_trait]
impl JobStore for DocpipePgStore {
    #[instrument(skip_all, fields(user = %job.user, job_type = %job.job_type))]
    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = job.into_job(JobId::new(), Utc::now());
        self.insert(&job).await.map_err(map_err)?;
        self.publish_change(job.id);
        Ok(job)
    }

    async fn find(&self, id: JobId, scope: &Scope) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {COLUMNS} FROM docpipe_jobs WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(row
            .map(Job::try_from)
            .transpose()?
            .filter(|job| scope.permits(job)))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut query = filter.select();
        query
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let mut query = filter.count();
        let count: i64 = query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    #[instrument(skip(self, patch))]
    async fn apply(&self, id: JobId, patch: JobPatch) -> Result<Patched, StoreError> {
        let (job, outcome) = self
            .modify(id, |job| Ok(job.apply_patch(patch, Utc::now())))
            .await?;
        Ok(Patched { job, outcome })
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, id: JobId, scope: &Scope) -> Result<Job, StoreError> {
        let scope = scope.clone();
        let (job, ()) = self
            .modify(id, move |job| {
                if !scope.permits(job) {
                    return Err(StoreError::JobNotFound(id));
                }
                job.request_cancel(Utc::now())
                    .map_err(|status| StoreError::AlreadyFinished { id, status })
            })
            .await?;
        Ok(job)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<JobId> {
        self.changes.subscribe()
    }
}

fn map_err(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Io(err) => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Tls(err) => StoreError::Unavailable(err.to_string()),
        sqlx::Error::PoolTimedOut => StoreError::Unavailable("pool timed out".to_owned()),
        sqlx::Error::PoolClosed => StoreError::Unavailable("pool closed".to_owned()),
        sqlx::Error::WorkerCrashed => StoreError::Unavailable("worker crashed".to_owned()),
        sqlx::Error::Protocol(err) => StoreError::Unavailable(err),
        error => {
            tracing::error!(?error, "Unexpected database error");
            StoreError::BadState
        }
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod test {
    use docpipe::{
        job::{JobStatus, TimelineEvent},
        store_test_suite,
    };
    use sqlx::PgPool;

    use super::*;

    store_test_suite!(
        attr: sqlx::test(migrations = false),
        args: (pool: PgPool),
        store: DocpipePgStore::from_pool(pool).await.unwrap()
    );

    #[sqlx::test(migrations = false)]
    async fn timeline_round_trips_through_jsonb(pool: PgPool) {
        let store = DocpipePgStore::from_pool(pool).await.unwrap();
        let job = store.create(NewJob::mock_job()).await.unwrap();
        store
            .apply(
                job.id,
                JobPatch::new()
                    .append(
                        docpipe::job::TimelineEntry::new(TimelineEvent::OcrProgress, Utc::now())
                            .with_message("OCR 40%")
                            .with_progress(40),
                    )
                    .with_status(JobStatus::Processing),
            )
            .await
            .unwrap();

        let found = store.find(job.id, &Scope::Any).await.unwrap().unwrap();

        let last = found.last_event().unwrap();
        assert_eq!(last.event, TimelineEvent::OcrProgress);
        assert_eq!(last.message.as_deref(), Some("OCR 40%"));
        assert_eq!(last.progress, Some(40));
    }

    #[sqlx::test(migrations = false)]
    async fn concurrent_patches_are_serialized(pool: PgPool) {
        let store = DocpipePgStore::from_pool(pool).await.unwrap();
        let job = store.create(NewJob::mock_job()).await.unwrap();

        let patches = (0..10).map(|n| {
            let store = store.clone();
            async move {
                store
                    .apply(
                        job.id,
                        JobPatch::new().append(
                            docpipe::job::TimelineEntry::new(TimelineEvent::OcrProgress, Utc::now())
                                .with_progress(n * 10),
                        ),
                    )
                    .await
                    .unwrap();
            }
        });
        futures::future::join_all(patches).await;

        let found = store.find(job.id, &Scope::Any).await.unwrap().unwrap();
        assert_eq!(found.timeline.len(), 11);
    }
}
