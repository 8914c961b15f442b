//! Job lifecycle tracking for asynchronous document processing.
//!
//! A job is created through the API, handed to a [`queue::Queue`], worked on
//! by a [`Docpipe`] worker runtime and reported back through the
//! [`ingress::WebhookIngress`]. The [`store::JobStore`] holds the single
//! authoritative record of every job and [`progress`] derives what clients
//! see from it.
//!
//! The worker side is set up by registering the stages it should consume:
//!
//! ```
//! # use std::sync::Arc;
//! # use async_trait::async_trait;
//! # use docpipe::prelude::*;
//! # use docpipe::executor::{CapabilityError, ProgressSink};
//! struct EchoExtractor;
//!
//! #[async_trait]
//! impl Extractor for EchoExtractor {
//!     async fn extract(
//!         &self,
//!         file_url: &str,
//!         _progress: &dyn ProgressSink,
//!     ) -> Result<String, CapabilityError> {
//!         Ok(format!("text of {file_url}"))
//!     }
//! }
//!
//! struct FirstLine;
//!
//! #[async_trait]
//! impl Summarizer for FirstLine {
//!     async fn summarize(&self, text: &str) -> Result<String, CapabilityError> {
//!         Ok(text.lines().next().unwrap_or_default().to_owned())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
//! let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
//! let ingress = WebhookIngress::new(store.clone(), Dispatcher::new(queue.clone()));
//! let reporter = Arc::new(LocalReporter::new(ingress, store.clone()));
//! let executor = StageExecutor::new(reporter, Arc::new(EchoExtractor), Arc::new(FirstLine));
//!
//! let runtime = Docpipe::new(queue, executor)
//!     .with_max_concurrency(2)
//!     .with_stage(Stage::Extraction)
//!     .with_stage(Stage::Summarization);
//!
//! runtime.graceful_shutdown().await.unwrap();
//! # });
//! ```

use std::sync::Arc;

use executor::StageExecutor;
use queue::{Queue, QueueError, Stage};
use runner::StageRunner;
use store::StoreError;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub mod executor;
pub mod ingress;
pub mod job;
pub mod notifier;
pub mod prelude;
pub mod progress;
pub mod queue;
pub mod reporter;
mod runner;
pub mod store;
pub mod sweeper;
pub mod testing;

/// The worker runtime.
///
/// Runs one consumer loop per registered [`Stage`]. All loops share a single
/// pool of permits, one per work item, so at most `max_concurrency` items
/// execute at once across the whole process, whichever stages they belong to.
pub struct Docpipe {
    queue: Arc<dyn Queue>,
    executor: Arc<StageExecutor>,
    permits: Arc<Semaphore>,
    cancellation_token: CancellationToken,
    handles: Vec<(Stage, JoinHandle<()>)>,
}

impl Docpipe {
    pub const DEFAULT_MAX_CONCURRENCY: usize = 1;

    pub fn new(queue: Arc<dyn Queue>, executor: StageExecutor) -> Self {
        Self {
            queue,
            executor: Arc::new(executor),
            permits: Arc::new(Semaphore::new(Self::DEFAULT_MAX_CONCURRENCY)),
            cancellation_token: Default::default(),
            handles: Vec::new(),
        }
    }

    /// Sets how many work items may run at the same time.
    ///
    /// Applies to stages registered after this call.
    pub fn with_max_concurrency(self, max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            ..self
        }
    }

    /// Starts consuming the stage's queue.
    pub fn with_stage(mut self, stage: Stage) -> Self {
        if self.handles.iter().any(|(running, _)| *running == stage) {
            tracing::warn!(%stage, "Stage already registered");
            return self;
        }
        let runner = StageRunner::new(
            stage,
            self.queue.clone(),
            self.executor.clone(),
            self.permits.clone(),
        );
        let handle = tokio::spawn(runner.run(self.cancellation_token.child_token()));
        self.handles.push((stage, handle));
        self
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.handles.iter().map(|(stage, _)| *stage)
    }

    /// Token cancelled on shutdown, for tying other tasks to the runtime.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stops consuming and waits for running stages to finish.
    pub async fn graceful_shutdown(self) -> Result<(), DocpipeError> {
        tracing::debug!("Shutting down docpipe stage runners");
        self.cancellation_token.cancel();
        futures::future::join_all(self.handles.into_iter().map(|(_, handle)| handle))
            .await
            .into_iter()
            .try_for_each(|joined| joined.map_err(|_| DocpipeError::GracefulShutdownFailed))
    }
}

impl std::fmt::Debug for Docpipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Docpipe")
            .field("stages", &self.stages().collect::<Vec<_>>())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum DocpipeError {
    #[error("Invalid job request: {0}")]
    Validation(String),
    #[error("Error communicating with the job store")]
    Store(#[from] StoreError),
    #[error("Error communicating with the queue")]
    Queue(#[from] QueueError),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}
