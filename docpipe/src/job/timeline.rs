use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobStatus;

/// Lifecycle event recorded on a job's timeline.
///
/// Unknown event names reported by workers are preserved verbatim in
/// [`TimelineEvent::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TimelineEvent {
    Queued,
    EnqueueDeferred,
    ExtractionStarted,
    OcrProgress,
    ExtractionCompleted,
    SummarizationQueued,
    SummarizationDeferred,
    SummarizationStarted,
    SummarizationCompleted,
    CancelRequested,
    JobCancelled,
    JobFailed,
    Other(String),
}

impl TimelineEvent {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::EnqueueDeferred => "enqueue_deferred",
            Self::ExtractionStarted => "extraction_started",
            Self::OcrProgress => "ocr_progress",
            Self::ExtractionCompleted => "extraction_completed",
            Self::SummarizationQueued => "summarization_queued",
            Self::SummarizationDeferred => "summarization_deferred",
            Self::SummarizationStarted => "summarization_started",
            Self::SummarizationCompleted => "summarization_completed",
            Self::CancelRequested => "cancel_requested",
            Self::JobCancelled => "job_cancelled",
            Self::JobFailed => "job_failed",
            Self::Other(name) => name,
        }
    }

    /// Human readable form used by progress views.
    pub fn label(&self) -> String {
        match self {
            Self::Queued => "Queued".to_owned(),
            Self::EnqueueDeferred => "Waiting for queue".to_owned(),
            Self::ExtractionStarted => "Extraction started".to_owned(),
            Self::OcrProgress => "OCR in progress".to_owned(),
            Self::ExtractionCompleted => "Text extracted".to_owned(),
            Self::SummarizationQueued => "Summary queued".to_owned(),
            Self::SummarizationDeferred => "Summary waiting for queue".to_owned(),
            Self::SummarizationStarted => "Summarizing".to_owned(),
            Self::SummarizationCompleted => "Summary ready".to_owned(),
            Self::CancelRequested => "Cancellation requested".to_owned(),
            Self::JobCancelled => "Cancelled".to_owned(),
            Self::JobFailed => "Failed".to_owned(),
            Self::Other(name) => {
                let spaced = name.replace(['_', '-'], " ");
                let mut chars = spaced.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        }
    }

    /// Entry recorded when a status change arrives without an explicit event.
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => Self::Queued,
            JobStatus::Processing => Self::ExtractionStarted,
            JobStatus::Extracted => Self::ExtractionCompleted,
            JobStatus::Summarizing => Self::SummarizationStarted,
            JobStatus::Completed => Self::SummarizationCompleted,
            JobStatus::Failed => Self::JobFailed,
            JobStatus::Cancelled => Self::JobCancelled,
        }
    }
}

impl From<&str> for TimelineEvent {
    fn from(value: &str) -> Self {
        match value {
            "queued" => Self::Queued,
            "enqueue_deferred" => Self::EnqueueDeferred,
            "extraction_started" => Self::ExtractionStarted,
            "ocr_progress" => Self::OcrProgress,
            "extraction_completed" => Self::ExtractionCompleted,
            "summarization_queued" => Self::SummarizationQueued,
            "summarization_deferred" => Self::SummarizationDeferred,
            "summarization_started" => Self::SummarizationStarted,
            "summarization_completed" => Self::SummarizationCompleted,
            "cancel_requested" => Self::CancelRequested,
            "job_cancelled" => Self::JobCancelled,
            "job_failed" => Self::JobFailed,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl From<String> for TimelineEvent {
    fn from(value: String) -> Self {
        match Self::from(value.as_str()) {
            Self::Other(_) => Self::Other(value),
            known => known,
        }
    }
}

impl From<TimelineEvent> for String {
    fn from(value: TimelineEvent) -> Self {
        match value {
            TimelineEvent::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl Display for TimelineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub event: TimelineEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(event: TimelineEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            event,
            message: None,
            progress: None,
            timestamp,
        }
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..self
        }
    }

    pub fn with_progress(self, progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_names_map_to_variants() {
        assert_eq!(
            TimelineEvent::from("extraction_completed"),
            TimelineEvent::ExtractionCompleted
        );
        assert_eq!(
            TimelineEvent::from("thumbnail_rendered".to_owned()),
            TimelineEvent::Other("thumbnail_rendered".to_owned())
        );
    }

    #[test]
    fn serializes_as_bare_string() {
        let entry = TimelineEntry::new(TimelineEvent::OcrProgress, Utc::now()).with_progress(40);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["event"], "ocr_progress");
        assert_eq!(value["progress"], 40);
        assert!(value.get("message").is_none());

        let other: TimelineEvent = serde_json::from_str("\"custom_step\"").unwrap();
        assert_eq!(serde_json::to_string(&other).unwrap(), "\"custom_step\"");
    }

    #[test]
    fn labels_are_human_readable() {
        assert_eq!(TimelineEvent::ExtractionCompleted.label(), "Text extracted");
        assert_eq!(
            TimelineEvent::Other("page_split-done".to_owned()).label(),
            "Page split done"
        );
    }

    #[test]
    fn every_status_has_a_synthesized_event() {
        assert_eq!(
            TimelineEvent::for_status(JobStatus::Extracted),
            TimelineEvent::ExtractionCompleted
        );
        assert_eq!(
            TimelineEvent::for_status(JobStatus::Failed),
            TimelineEvent::JobFailed
        );
    }
}
