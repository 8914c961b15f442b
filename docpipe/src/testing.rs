//! Helpers for testing.

/// Asserts how many work items for a job are waiting in an
/// [`InMemoryQueue`](crate::queue::memory::InMemoryQueue).
///
/// # Example
///
/// ```
/// # use docpipe::prelude::*;
/// # use docpipe::assert_published;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let queue = InMemoryQueue::new();
/// let job_id = JobId::new();
/// queue.publish(&WorkItem::summarization(job_id, "some text")).await.unwrap();
///
/// assert_published!(to: queue, stage: Stage::Summarization, job: job_id);
/// assert_published!(0 items, to: queue, stage: Stage::Extraction, job: job_id);
/// # });
/// ```
#[macro_export]
macro_rules! assert_published {
    (to: $queue:expr, stage: $stage:expr, job: $job:expr) => {
        $crate::assert_published!(1 items, to: $queue, stage: $stage, job: $job)
    };
    ($n:literal items, to: $queue:expr, stage: $stage:expr, job: $job:expr) => {{
        let stage = $stage;
        let job_id = $job;
        let items: Vec<_> = $queue
            .pending(stage)
            .into_iter()
            .filter(|item| item.job_id == job_id)
            .collect();
        assert!(
            items.len() == $n,
            "Expected {} work item(s) for job {} on stage {}, found {}:\n{:#?}",
            $n,
            job_id,
            stage,
            items.len(),
            items,
        );
    }};
}
