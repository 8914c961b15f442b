//! Derived progress views of a job.
//!
//! Progress is computed from the timeline rather than stored, so it can
//! never disagree with the audit history. Each canonical step reached counts
//! once regardless of how often it was reported.
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{Job, JobId, JobStatus, TimelineEvent};

mod stream;

pub use stream::{ProgressStream, StreamEvent};

const STEPS: usize = 5;

/// The ordered lifecycle steps progress is measured against.
pub const CANONICAL_SEQUENCE: [TimelineEvent; STEPS] = [
    TimelineEvent::Queued,
    TimelineEvent::ExtractionStarted,
    TimelineEvent::ExtractionCompleted,
    TimelineEvent::SummarizationStarted,
    TimelineEvent::SummarizationCompleted,
];

/// Percentage of canonical steps present among the events.
pub fn percent_for_events<'a>(events: impl IntoIterator<Item = &'a TimelineEvent>) -> u8 {
    let mut reached = [false; STEPS];
    for event in events {
        if let Some(index) = CANONICAL_SEQUENCE.iter().position(|step| step == event) {
            reached[index] = true;
        }
    }
    let count = reached.iter().filter(|reached| **reached).count();
    ((count * 100) as f64 / STEPS as f64)
        .round()
        .min(100.0) as u8
}

/// A completed job is always reported as fully done, as is a job whose
/// extraction was its only stage.
pub fn percent_complete(job: &Job) -> u8 {
    if job.status == JobStatus::Completed
        || (job.job_type.ends_at_extraction() && job.extracted_text.is_some())
    {
        return 100;
    }
    percent_for_events(job.timeline.iter().map(|entry| &entry.event))
}

/// Seconds left, extrapolated linearly from the time spent since queueing.
///
/// Withheld for finished jobs, for jobs without progress, and when the
/// timeline has no `queued` entry to measure from.
pub fn eta_seconds(job: &Job, percent: u8, now: DateTime<Utc>) -> Option<u64> {
    if percent == 0
        || percent >= 100
        || job.is_terminal()
        || job.has_event(&TimelineEvent::SummarizationCompleted)
    {
        return None;
    }
    let queued_at = job.queued_at()?;
    let elapsed_ms = (now - queued_at).num_milliseconds().max(0) as f64;
    let estimated_total_ms = elapsed_ms / (f64::from(percent) / 100.0);
    let remaining = ((estimated_total_ms - elapsed_ms) / 1000.0).round().max(1.0);
    Some(remaining as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineStep {
    pub event: TimelineEvent,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub eta_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_progress: Option<u8>,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<TimelineEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timeline: Vec<TimelineStep>,
}

impl ProgressView {
    pub fn project(job: &Job, now: DateTime<Utc>) -> Self {
        let progress = percent_complete(job);
        Self {
            job_id: job.id,
            status: job.status,
            progress,
            eta_seconds: eta_seconds(job, progress, now),
            stage_progress: job.stage_progress,
            cancel_requested: job.cancel_requested,
            last_event: job.last_event().map(|entry| entry.event.clone()),
            error: job.error.clone(),
            timeline: job
                .timeline
                .iter()
                .map(|entry| TimelineStep {
                    event: entry.event.clone(),
                    label: entry.event.label(),
                    message: entry.message.clone(),
                    progress: entry.progress,
                    timestamp: entry.timestamp,
                })
                .collect(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal() || self.progress >= 100
    }
}
