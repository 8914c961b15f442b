use chrono::{DateTime, Utc};

use super::{Job, JobStatus, TimelineEntry, TimelineEvent};

/// A partial update to a job record.
///
/// Timeline entries are always appended. Field updates only land when the
/// requested status change is legal, see [`JobStatus::can_transition_to`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub events: Vec<TimelineEntry>,
    pub status: Option<JobStatus>,
    pub extracted_text: Option<String>,
    pub summary: Option<String>,
    pub processed_url: Option<String>,
    pub error: Option<String>,
    pub stage_progress: Option<u8>,
    pub queue_ref: Option<String>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(mut self, entry: TimelineEntry) -> Self {
        self.events.push(entry);
        self
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    pub fn with_extracted_text(self, text: impl Into<String>) -> Self {
        Self {
            extracted_text: Some(text.into()),
            ..self
        }
    }

    pub fn with_summary(self, summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..self
        }
    }

    pub fn with_processed_url(self, url: impl Into<String>) -> Self {
        Self {
            processed_url: Some(url.into()),
            ..self
        }
    }

    pub fn with_error(self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self
        }
    }

    pub fn with_stage_progress(self, progress: u8) -> Self {
        Self {
            stage_progress: Some(progress.min(100)),
            ..self
        }
    }

    pub fn with_queue_ref(self, queue_ref: impl Into<String>) -> Self {
        Self {
            queue_ref: Some(queue_ref.into()),
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    pub previous: JobStatus,
    /// Whether the field updates of the patch were applied.
    pub accepted: bool,
    pub status_changed: bool,
    /// The status the patch asked for when that move was illegal.
    pub rejected: Option<JobStatus>,
}

impl Job {
    pub fn apply_patch(&mut self, patch: JobPatch, now: DateTime<Utc>) -> PatchOutcome {
        let previous = self.status;
        let requested = patch.status.map(|next| self.job_type.settle(next));
        let mut outcome = PatchOutcome {
            previous,
            accepted: false,
            status_changed: false,
            rejected: None,
        };

        outcome.accepted = match requested {
            Some(next) if previous.can_transition_to(next) => true,
            Some(next) => {
                outcome.rejected = Some(next);
                false
            }
            None => !previous.is_terminal(),
        };

        let mut events = patch.events;
        if outcome.accepted {
            if let Some(next) = requested.filter(|next| *next != previous) {
                if events.is_empty() {
                    events.push(TimelineEntry::new(TimelineEvent::for_status(next), now));
                }
                self.status = next;
                outcome.status_changed = true;
            }
            if let Some(text) = patch.extracted_text {
                self.extracted_text = Some(text);
            }
            if let Some(summary) = patch.summary {
                self.summary = Some(summary);
            }
            if let Some(url) = patch.processed_url {
                self.processed_url = Some(url);
            }
            if let Some(error) = patch.error {
                self.error = Some(error);
            }
            if let Some(progress) = patch.stage_progress {
                self.stage_progress = Some(progress);
            }
        }
        if let Some(queue_ref) = patch.queue_ref {
            self.queue_ref = Some(queue_ref);
        }
        for entry in events {
            self.push_entry(entry);
        }
        self.updated_at = now;

        outcome
    }
}
