use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::IngressError;
use crate::job::{JobId, JobPatch, JobStatus, TimelineEntry, TimelineEvent};

/// Status update body posted by workers.
///
/// Every field may appear at the top level or inside `data`. The top level
/// wins when both are present. Several historical spellings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(default, alias = "job_id", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, alias = "extracted_text", skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    #[serde(
        default,
        alias = "processed_url",
        alias = "processedurl",
        skip_serializing_if = "Option::is_none"
    )]
    pub processed_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(
        default,
        alias = "queue_ref",
        alias = "bullJobId",
        alias = "builJobId",
        skip_serializing_if = "Option::is_none"
    )]
    pub queue_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<WebhookPayload>>,
}

impl WebhookPayload {
    pub fn event(job_id: JobId, event: TimelineEvent) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            event: Some(event.into()),
            ..Default::default()
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
            progress: Some(Value::from(progress)),
            ..self
        }
    }

    pub fn with_error(self, error: impl Into<String>) -> Self {
        Self {
            error: Some(Value::String(error.into())),
            ..self
        }
    }

    /// Nests the extracted text under `data` the way workers report results.
    pub fn with_extracted_text(self, text: impl Into<String>) -> Self {
        let mut data = self.data.unwrap_or_default();
        data.extracted_text = Some(Value::String(text.into()));
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn with_summary(self, summary: impl Into<String>) -> Self {
        let mut data = self.data.unwrap_or_default();
        data.summary = Some(Value::String(summary.into()));
        Self {
            data: Some(data),
            ..self
        }
    }

    /// Resolves aliases and nesting into a single update.
    pub fn normalize(self) -> Result<WebhookUpdate, IngressError> {
        let nested = self.data.map(|data| *data).unwrap_or_default();

        let raw_id = non_blank(self.job_id)
            .or_else(|| non_blank(nested.job_id))
            .ok_or(IngressError::MissingJobId)?;
        let job_id = raw_id
            .parse()
            .map_err(|_| IngressError::InvalidJobId(raw_id.clone()))?;

        Ok(WebhookUpdate {
            job_id,
            event: non_blank(self.event)
                .or_else(|| non_blank(nested.event))
                .map(TimelineEvent::from),
            message: non_blank(self.message).or_else(|| non_blank(nested.message)),
            extracted_text: text(self.extracted_text).or_else(|| text(nested.extracted_text)),
            summary: text(self.summary).or_else(|| text(nested.summary)),
            processed_url: non_blank(self.processed_url)
                .or_else(|| non_blank(nested.processed_url)),
            progress: percent(self.progress).or_else(|| percent(nested.progress)),
            error: error(self.error).or_else(|| error(nested.error)),
            queue_ref: non_blank(self.queue_ref).or_else(|| non_blank(nested.queue_ref)),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn text(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) => non_blank(Some(text)),
        _ => None,
    }
}

fn percent(value: Option<Value>) -> Option<u8> {
    let number = match value? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number
        .is_finite()
        .then(|| number.round().clamp(0.0, 100.0) as u8)
}

fn error(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null | Value::Bool(false) => None,
        Value::String(message) => non_blank(Some(message)),
        other => Some(other.to_string()),
    }
}

/// A validated worker update for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookUpdate {
    pub job_id: JobId,
    pub event: Option<TimelineEvent>,
    pub message: Option<String>,
    pub extracted_text: Option<String>,
    pub summary: Option<String>,
    pub processed_url: Option<String>,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub queue_ref: Option<String>,
}

impl WebhookUpdate {
    pub fn is_cancellation(&self) -> bool {
        self.event == Some(TimelineEvent::JobCancelled)
    }

    /// Whether this update delivers extraction output ready to be summarized.
    pub fn completes_extraction(&self) -> bool {
        self.extracted_text.is_some()
            && self.summary.is_none()
            && self.error.is_none()
            && !self.is_cancellation()
    }

    /// Maps the update onto a patch of the job record.
    ///
    /// A cancellation only records the event and the status. An error fails
    /// the job whatever else was reported. Otherwise the latest stage with
    /// output decides the status: a summary completes, extracted text marks
    /// the job extracted, and `*_started` events move it into processing.
    pub fn into_patch(self, now: DateTime<Utc>) -> JobPatch {
        let mut patch = JobPatch::new();
        if let Some(event) = self.event.clone() {
            let mut entry = TimelineEntry::new(event, now);
            entry.message = self.message.clone();
            entry.progress = self.progress;
            patch = patch.append(entry);
        }

        if self.is_cancellation() {
            return patch.with_status(JobStatus::Cancelled);
        }

        if let Some(error) = self.error {
            if self.event != Some(TimelineEvent::JobFailed) {
                patch = patch.append(
                    TimelineEntry::new(TimelineEvent::JobFailed, now).with_message(error.clone()),
                );
            }
            return patch.with_status(JobStatus::Failed).with_error(error);
        }

        patch.status = match self.event {
            Some(TimelineEvent::ExtractionStarted) => Some(JobStatus::Processing),
            Some(TimelineEvent::SummarizationStarted) => Some(JobStatus::Summarizing),
            _ => None,
        };
        if let Some(text) = self.extracted_text {
            patch = patch
                .with_status(JobStatus::Extracted)
                .with_extracted_text(text);
        }
        if let Some(summary) = self.summary {
            patch = patch
                .with_status(JobStatus::Completed)
                .with_summary(summary);
        }
        if let Some(progress) = self.progress {
            patch = patch.with_stage_progress(progress);
        }
        if let Some(url) = self.processed_url {
            patch = patch.with_processed_url(url);
        }
        if let Some(queue_ref) = self.queue_ref {
            patch = patch.with_queue_ref(queue_ref);
        }
        patch
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> Result<WebhookUpdate, IngressError> {
        serde_json::from_value::<WebhookPayload>(value)
            .unwrap()
            .normalize()
    }

    #[test]
    fn flat_fields_win_over_nested() {
        let id = JobId::new();
        let update = parse(json!({
            "jobId": id.to_string(),
            "extractedText": "  flat  ",
            "data": { "extractedText": "nested", "summary": "nested summary" },
        }))
        .unwrap();

        assert_eq!(update.job_id, id);
        assert_eq!(update.extracted_text.as_deref(), Some("flat"));
        assert_eq!(update.summary.as_deref(), Some("nested summary"));
    }

    #[test]
    fn nested_job_id_and_aliases_are_accepted() {
        let id = JobId::new();
        let update = parse(json!({
            "event": "ocr_progress",
            "data": {
                "job_id": id.to_string(),
                "progress": "42.4",
                "processedurl": "https://x/p",
            },
            "bullJobId": "17",
        }))
        .unwrap();

        assert_eq!(update.job_id, id);
        assert_eq!(update.progress, Some(42));
        assert_eq!(update.queue_ref.as_deref(), Some("17"));
        assert_eq!(update.processed_url.as_deref(), Some("https://x/p"));
        assert_eq!(update.event, Some(TimelineEvent::OcrProgress));
    }

    #[test]
    fn missing_or_malformed_job_id_is_rejected() {
        assert_matches!(parse(json!({ "event": "x" })), Err(IngressError::MissingJobId));
        assert_matches!(parse(json!({ "jobId": "  " })), Err(IngressError::MissingJobId));
        assert_matches!(
            parse(json!({ "jobId": "abc" })),
            Err(IngressError::InvalidJobId(id)) if id == "abc"
        );
    }

    #[test]
    fn blank_and_non_string_outputs_are_ignored() {
        let update = parse(json!({
            "jobId": JobId::new().to_string(),
            "extractedText": "   ",
            "summary": 12,
            "progress": "lots",
            "error": false,
        }))
        .unwrap();

        assert_eq!(update.extracted_text, None);
        assert_eq!(update.summary, None);
        assert_eq!(update.progress, None);
        assert_eq!(update.error, None);
    }

    #[test]
    fn structured_errors_are_stringified() {
        let update = parse(json!({
            "jobId": JobId::new().to_string(),
            "error": { "code": 500 },
        }))
        .unwrap();
        assert_eq!(update.error.as_deref(), Some(r#"{"code":500}"#));
    }

    #[test]
    fn worker_payload_round_trips_through_nesting() {
        let id = JobId::new();
        let payload = WebhookPayload::event(id, TimelineEvent::ExtractionCompleted)
            .with_extracted_text("hello");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["data"]["extractedText"], "hello");
        assert!(value.get("extractedText").is_none());

        let update = parse(value).unwrap();
        assert_eq!(update.extracted_text.as_deref(), Some("hello"));
        assert!(update.completes_extraction());
    }

    #[test]
    fn started_events_move_status_forward() {
        let id = JobId::new();
        let patch = WebhookPayload::event(id, TimelineEvent::SummarizationStarted)
            .normalize()
            .unwrap()
            .into_patch(Utc::now());
        assert_eq!(patch.status, Some(JobStatus::Summarizing));
        assert_eq!(patch.events.len(), 1);

        let patch = WebhookPayload::event(id, TimelineEvent::OcrProgress)
            .with_progress(30)
            .normalize()
            .unwrap()
            .into_patch(Utc::now());
        assert_eq!(patch.status, None);
        assert_eq!(patch.stage_progress, Some(30));
        assert_eq!(patch.events[0].progress, Some(30));
    }

    #[test]
    fn error_fails_job_and_logs_both_events() {
        let patch = WebhookPayload::event(JobId::new(), TimelineEvent::ExtractionStarted)
            .with_error("OCR service unreachable")
            .with_extracted_text("ignored")
            .normalize()
            .unwrap()
            .into_patch(Utc::now());

        assert_eq!(patch.status, Some(JobStatus::Failed));
        assert_eq!(patch.error.as_deref(), Some("OCR service unreachable"));
        assert_eq!(patch.extracted_text, None);
        let events: Vec<_> = patch.events.iter().map(|e| e.event.clone()).collect();
        assert_eq!(
            events,
            vec![TimelineEvent::ExtractionStarted, TimelineEvent::JobFailed]
        );
    }

    #[test]
    fn cancellation_short_circuits() {
        let patch = WebhookPayload::event(JobId::new(), TimelineEvent::JobCancelled)
            .with_summary("ignored")
            .normalize()
            .unwrap()
            .into_patch(Utc::now());

        assert_eq!(patch.status, Some(JobStatus::Cancelled));
        assert_eq!(patch.summary, None);
        assert_eq!(patch.events.len(), 1);
    }

    #[test]
    fn summary_completes_job() {
        let patch = WebhookPayload::event(JobId::new(), TimelineEvent::SummarizationCompleted)
            .with_summary("- a\n- b")
            .normalize()
            .unwrap()
            .into_patch(Utc::now());
        assert_eq!(patch.status, Some(JobStatus::Completed));
        assert_eq!(patch.summary.as_deref(), Some("- a\n- b"));
    }
}
