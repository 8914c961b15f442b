use chrono::{DateTime, Utc};
use docpipe::{
    job::{Job, JobType, TimelineEntry},
    store::StoreError,
};
use sqlx::prelude::FromRow;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "docpipe_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Queued,
    Processing,
    Extracted,
    Summarizing,
    Completed,
    Failed,
    Cancelled,
}

impl sqlx::postgres::PgHasArrayType for JobStatus {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_docpipe_job_status")
    }
}

impl From<JobStatus> for docpipe::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Queued => Self::Queued,
            JobStatus::Processing => Self::Processing,
            JobStatus::Extracted => Self::Extracted,
            JobStatus::Summarizing => Self::Summarizing,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<docpipe::job::JobStatus> for JobStatus {
    fn from(value: docpipe::job::JobStatus) -> Self {
        match value {
            docpipe::job::JobStatus::Queued => Self::Queued,
            docpipe::job::JobStatus::Processing => Self::Processing,
            docpipe::job::JobStatus::Extracted => Self::Extracted,
            docpipe::job::JobStatus::Summarizing => Self::Summarizing,
            docpipe::job::JobStatus::Completed => Self::Completed,
            docpipe::job::JobStatus::Failed => Self::Failed,
            docpipe::job::JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

pub(crate) const COLUMNS: &str = r#"
    id,
    user_id,
    job_type,
    file_url,
    status,
    timeline,
    extracted_text,
    summary,
    processed_url,
    error,
    stage_progress,
    cancel_requested,
    queue_ref,
    notify_email,
    created_at,
    updated_at"#;

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub user_id: String,
    pub job_type: String,
    pub file_url: Option<String>,
    pub status: JobStatus,
    pub timeline: serde_json::Value,
    pub extracted_text: Option<String>,
    pub summary: Option<String>,
    pub processed_url: Option<String>,
    pub error: Option<String>,
    pub stage_progress: Option<i16>,
    pub cancel_requested: bool,
    pub queue_ref: Option<String>,
    pub notify_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        let job_type: JobType = value.job_type.parse().map_err(|error| {
            tracing::error!(?error, id = %value.id, "Stored job has an unknown type");
            StoreError::BadState
        })?;
        let timeline: Vec<TimelineEntry> = serde_json::from_value(value.timeline)?;
        Ok(Self {
            id: value.id.into(),
            user: value.user_id.into(),
            job_type,
            file_url: value.file_url,
            status: value.status.into(),
            timeline,
            extracted_text: value.extracted_text,
            summary: value.summary,
            processed_url: value.processed_url,
            error: value.error,
            stage_progress: value
                .stage_progress
                .and_then(|progress| u8::try_from(progress.clamp(0, 100)).ok()),
            cancel_requested: value.cancel_requested,
            queue_ref: value.queue_ref,
            notify_email: value.notify_email,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}
