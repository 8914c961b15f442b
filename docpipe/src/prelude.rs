//! The purpose of this module is to alleviate the need to import many of the `[docpipe]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use docpipe::prelude::*;
//! ```
pub use crate::executor::{
    CapabilityError, ExecutionResult, Extractor, ProgressSink, StageExecutor, Summarizer, Tick,
};
pub use crate::ingress::{WebhookIngress, WebhookPayload, WorkerSecret};
pub use crate::job::builder::{Enqueued, JobBuilder};
pub use crate::job::{Job, JobId, JobPatch, JobStatus, JobType, TimelineEntry, TimelineEvent};
pub use crate::notifier::Notifier;
pub use crate::progress::{ProgressStream, ProgressView, StreamEvent};
pub use crate::queue::{memory::InMemoryQueue, Dispatcher, Queue, Stage, StagePayload, WorkItem};
pub use crate::reporter::{LocalReporter, Reporter};
pub use crate::store::{memory::InMemoryStore, JobFilter, JobStore, NewJob, Scope};
pub use crate::sweeper::{Sweeper, SweeperConfig};
pub use crate::Docpipe;
