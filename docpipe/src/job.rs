use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::queue::Stage;

pub mod builder;
mod patch;
pub mod status;
pub mod timeline;

pub use patch::{JobPatch, PatchOutcome};
pub use status::JobStatus;
pub use timeline::{TimelineEntry, TimelineEvent};

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the account that owns a job.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    #[serde(alias = "ai-extract-text")]
    ExtractText,
    #[serde(alias = "ai-summarize")]
    Summarize,
    OcrOnly,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractText => "extract-text",
            Self::Summarize => "summarize",
            Self::OcrOnly => "ocr-only",
        }
    }

    /// The queue stage a freshly created job of this type is published to.
    pub fn first_stage(&self) -> Stage {
        match self {
            Self::ExtractText | Self::OcrOnly => Stage::Extraction,
            Self::Summarize => Stage::Summarization,
        }
    }

    /// Whether a successful extraction should be followed by summarization.
    pub fn chains_summary(&self) -> bool {
        matches!(self, Self::ExtractText)
    }

    /// Whether the job is done once its text has been extracted.
    pub fn ends_at_extraction(&self) -> bool {
        matches!(self, Self::OcrOnly)
    }

    /// The status a job of this type actually takes when `status` is requested.
    pub fn settle(&self, status: JobStatus) -> JobStatus {
        match status {
            JobStatus::Extracted if self.ends_at_extraction() => JobStatus::Completed,
            other => other,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job type: {0}")]
pub struct UnknownJobType(pub String);

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract-text" | "ai-extract-text" => Ok(Self::ExtractText),
            "summarize" | "ai-summarize" => Ok(Self::Summarize),
            "ocr-only" => Ok(Self::OcrOnly),
            other => Err(UnknownJobType(other.to_owned())),
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable record of one unit of user-requested document work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub user: UserId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    pub status: JobStatus,
    pub timeline: Vec<TimelineEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_progress: Option<u8>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_ref: Option<String>,
    #[serde(default, skip_serializing)]
    pub notify_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// What a worker polling for cancellation is told.
    pub fn should_cancel(&self) -> bool {
        self.cancel_requested || self.status == JobStatus::Cancelled
    }

    pub fn has_event(&self, event: &TimelineEvent) -> bool {
        self.timeline.iter().any(|entry| &entry.event == event)
    }

    pub fn last_event(&self) -> Option<&TimelineEntry> {
        self.timeline.last()
    }

    /// Time of the earliest `queued` entry, the baseline for ETA estimates.
    pub fn queued_at(&self) -> Option<DateTime<Utc>> {
        self.timeline
            .iter()
            .find(|entry| entry.event == TimelineEvent::Queued)
            .map(|entry| entry.timestamp)
    }

    /// Records a user's request to stop the job.
    ///
    /// A job still sitting in the queue is cancelled on the spot. A job a
    /// worker has picked up is only flagged, the worker observes the flag at
    /// its next checkpoint and reports `job_cancelled` itself.
    ///
    /// Returns the current status when the job has already finished.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> Result<(), JobStatus> {
        if self.status.is_terminal() {
            return Err(self.status);
        }
        self.cancel_requested = true;
        self.push_entry(TimelineEntry::new(TimelineEvent::CancelRequested, now));
        if self.status == JobStatus::Queued {
            self.status = JobStatus::Cancelled;
            self.push_entry(
                TimelineEntry::new(TimelineEvent::JobCancelled, now)
                    .with_message("Cancelled before processing started"),
            );
        }
        self.updated_at = now;
        Ok(())
    }

    /// Appends keeping timestamps non-decreasing.
    pub(crate) fn push_entry(&mut self, mut entry: TimelineEntry) {
        if let Some(last) = self.timeline.last() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }
        self.timeline.push(entry);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use chrono::TimeDelta;

    use super::*;
    use crate::store::NewJob;

    impl Job {
        pub(crate) fn mock_job() -> Self {
            NewJob::mock_job().into_job(JobId::new(), Utc::now())
        }

        pub(crate) fn with_status(self, status: JobStatus) -> Self {
            Self { status, ..self }
        }

        pub(crate) fn with_entries(mut self, events: &[TimelineEvent]) -> Self {
            let start = self.created_at;
            for (offset, event) in events.iter().enumerate() {
                let timestamp = start + TimeDelta::seconds(offset as i64 + 1);
                self.push_entry(TimelineEntry::new(event.clone(), timestamp));
            }
            self
        }
    }

    #[test]
    fn job_id_parses_and_displays_as_plain_uuid() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn job_type_accepts_queue_topic_spellings() {
        assert_eq!("ai-extract-text".parse(), Ok(JobType::ExtractText));
        assert_eq!("ai-summarize".parse(), Ok(JobType::Summarize));
        assert_eq!("ocr-only".parse(), Ok(JobType::OcrOnly));
        assert_eq!(
            "thumbnail".parse::<JobType>(),
            Err(UnknownJobType("thumbnail".to_owned()))
        );

        let parsed: JobType = serde_json::from_str("\"ai-summarize\"").unwrap();
        assert_eq!(parsed, JobType::Summarize);
        assert_eq!(
            serde_json::to_string(&JobType::ExtractText).unwrap(),
            "\"extract-text\""
        );
    }

    #[test]
    fn first_stage_and_chaining_follow_job_type() {
        assert_eq!(JobType::ExtractText.first_stage(), Stage::Extraction);
        assert_eq!(JobType::OcrOnly.first_stage(), Stage::Extraction);
        assert_eq!(JobType::Summarize.first_stage(), Stage::Summarization);
        assert!(JobType::ExtractText.chains_summary());
        assert!(!JobType::OcrOnly.chains_summary());
        assert!(!JobType::Summarize.chains_summary());
    }

    #[test]
    fn extraction_settles_as_completion_for_ocr_only_jobs() {
        assert_eq!(
            JobType::OcrOnly.settle(JobStatus::Extracted),
            JobStatus::Completed
        );
        assert_eq!(
            JobType::OcrOnly.settle(JobStatus::Processing),
            JobStatus::Processing
        );
        assert_eq!(
            JobType::ExtractText.settle(JobStatus::Extracted),
            JobStatus::Extracted
        );
    }

    #[test]
    fn request_cancel_on_queued_job_cancels_immediately() {
        let mut job = Job::mock_job();
        job.request_cancel(Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancel_requested);
        assert!(job.has_event(&TimelineEvent::CancelRequested));
        assert!(job.has_event(&TimelineEvent::JobCancelled));
    }

    #[test]
    fn request_cancel_on_running_job_only_sets_flag() {
        let mut job = Job::mock_job().with_status(JobStatus::Processing);
        job.request_cancel(Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.should_cancel());
        assert!(!job.has_event(&TimelineEvent::JobCancelled));
    }

    #[test]
    fn request_cancel_on_finished_job_is_refused() {
        let mut job = Job::mock_job().with_status(JobStatus::Completed);
        let timeline_len = job.timeline.len();

        assert_eq!(job.request_cancel(Utc::now()), Err(JobStatus::Completed));
        assert!(!job.cancel_requested);
        assert_eq!(job.timeline.len(), timeline_len);
    }

    #[test]
    fn push_entry_never_goes_back_in_time() {
        let mut job = Job::mock_job();
        let earlier = job.created_at - TimeDelta::hours(1);
        job.push_entry(TimelineEntry::new(TimelineEvent::ExtractionStarted, earlier));

        let timestamps: Vec<_> = job.timeline.iter().map(|e| e.timestamp).collect();
        assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn queued_at_uses_first_queued_entry() {
        let job = Job::mock_job();
        assert_eq!(job.queued_at(), Some(job.created_at));
    }

    #[test]
    fn serializes_with_camel_case_and_hides_notification_address() {
        let mut job = Job::mock_job();
        job.notify_email = Some("owner@example.com".to_owned());
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["type"], "extract-text");
        assert_eq!(value["status"], "queued");
        assert_eq!(value["cancelRequested"], false);
        assert!(value.get("fileUrl").is_some());
        assert!(value.get("notifyEmail").is_none());
        assert_eq!(value["timeline"][0]["event"], "queued");
    }
}
