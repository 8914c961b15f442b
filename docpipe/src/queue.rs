//! Work queue between the API and the workers.
//!
//! Delivery is at-least-once: an item stays owned by the queue until the
//! consumer acknowledges it, and a consumer that crashes or releases the item
//! hands it back for redelivery. Consumers must therefore be idempotent per
//! `(job_id, stage)`.
use std::{fmt::Display, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Summarization,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Self::Extraction, Self::Summarization];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Summarization => "summarization",
        }
    }

    /// Name of the queue topic items for this stage are published under.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Extraction => "ai-extract-text",
            Self::Summarization => "ai-summarize",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s || stage.topic() == s)
            .ok_or_else(|| UnknownStage(s.to_owned()))
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Extract { file_url: String },
    Summarize { text: String },
}

/// A request for one stage of processing of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    pub payload: StagePayload,
}

impl WorkItem {
    pub fn extraction(job_id: JobId, file_url: impl Into<String>) -> Self {
        Self {
            job_id,
            payload: StagePayload::Extract {
                file_url: file_url.into(),
            },
        }
    }

    pub fn summarization(job_id: JobId, text: impl Into<String>) -> Self {
        Self {
            job_id,
            payload: StagePayload::Summarize { text: text.into() },
        }
    }

    pub fn stage(&self) -> Stage {
        match self.payload {
            StagePayload::Extract { .. } => Stage::Extraction,
            StagePayload::Summarize { .. } => Stage::Summarization,
        }
    }
}

/// Queue-assigned identity of a published item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemHandle(String);

impl ItemHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ItemHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for ItemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An item handed to a consumer, owned by it until acked or released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub handle: ItemHandle,
    pub item: WorkItem,
    /// Backend specific token needed to ack or release the item.
    pub receipt: String,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(&self, item: &WorkItem) -> Result<ItemHandle, QueueError>;

    /// Waits for the next item of the stage.
    ///
    /// Dropping the returned future before it resolves must not lose items.
    async fn consume(&self, stage: Stage) -> Result<Delivery, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hands the item back for redelivery.
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
    #[error("Error encoding or decoding work item")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Queue in bad state")]
    BadState,
}

/// Publishing side of the queue as seen by the API.
///
/// An API started without a queue still accepts and records work, publishes
/// then fail with [`QueueError::Unavailable`] and callers record a deferral.
#[derive(Clone, Default)]
pub struct Dispatcher {
    queue: Option<Arc<dyn Queue>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self { queue: Some(queue) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    #[tracing::instrument(skip(self, item), fields(job_id = %item.job_id, stage = %item.stage()))]
    pub async fn dispatch(&self, item: &WorkItem) -> Result<ItemHandle, QueueError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| QueueError::Unavailable("no queue configured".to_owned()))?;
        queue
            .publish(item)
            .await
            .inspect(|handle| tracing::debug!(%handle, "Published work item"))
            .inspect_err(|error| tracing::warn!(?error, "Failed to publish work item"))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
