//! Test suite for ensuring a correct implementation of a [`JobStore`].
//!
//! Backends invoke [`store_test_suite!`](crate::store_test_suite) from their own test module.
use std::time::Duration;

use chrono::Utc;

use super::*;

/// `assert_matches!` without pulling the crate into downstream builds.
macro_rules! expect_match {
    ($value:expr, $pattern:pat) => {
        match $value {
            $pattern => {}
            ref other => panic!(
                "assertion failed: `{:?}` does not match `{}`",
                other,
                stringify!($pattern)
            ),
        }
    };
}

impl NewJob {
    pub const DEFAULT_USER: &'static str = "user-1";

    pub fn mock_job() -> Self {
        Self {
            user: Self::DEFAULT_USER.into(),
            job_type: JobType::ExtractText,
            file_url: Some("https://files.example.com/scan.pdf".to_owned()),
            extracted_text: None,
            notify_email: None,
        }
    }

    pub fn with_user(self, user: impl Into<UserId>) -> Self {
        Self {
            user: user.into(),
            ..self
        }
    }

    pub fn with_job_type(self, job_type: JobType) -> Self {
        Self { job_type, ..self }
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        Self {
            extracted_text: Some(text.into()),
            ..self
        }
    }
}

#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn create_starts_queued_with_single_entry $args {
            let store = $store;
            $crate::store::testing::create_starts_queued_with_single_entry(store).await;
        }
        #[$attr]
        async fn find_respects_scope $args {
            let store = $store;
            $crate::store::testing::find_respects_scope(store).await;
        }
        #[$attr]
        async fn find_unknown_job $args {
            let store = $store;
            $crate::store::testing::find_unknown_job(store).await;
        }
        #[$attr]
        async fn apply_forward_patch $args {
            let store = $store;
            $crate::store::testing::apply_forward_patch(store).await;
        }
        #[$attr]
        async fn apply_rejects_regression $args {
            let store = $store;
            $crate::store::testing::apply_rejects_regression(store).await;
        }
        #[$attr]
        async fn apply_not_found $args {
            let store = $store;
            $crate::store::testing::apply_not_found(store).await;
        }
        #[$attr]
        async fn apply_keeps_timeline_ordered $args {
            let store = $store;
            $crate::store::testing::apply_keeps_timeline_ordered(store).await;
        }
        #[$attr]
        async fn request_cancel_queued_job $args {
            let store = $store;
            $crate::store::testing::request_cancel_queued_job(store).await;
        }
        #[$attr]
        async fn request_cancel_running_job $args {
            let store = $store;
            $crate::store::testing::request_cancel_running_job(store).await;
        }
        #[$attr]
        async fn request_cancel_finished_job $args {
            let store = $store;
            $crate::store::testing::request_cancel_finished_job(store).await;
        }
        #[$attr]
        async fn request_cancel_other_users_job $args {
            let store = $store;
            $crate::store::testing::request_cancel_other_users_job(store).await;
        }
        #[$attr]
        async fn list_newest_first_and_paginated $args {
            let store = $store;
            $crate::store::testing::list_newest_first_and_paginated(store).await;
        }
        #[$attr]
        async fn list_filters_by_status_and_staleness $args {
            let store = $store;
            $crate::store::testing::list_filters_by_status_and_staleness(store).await;
        }
        #[$attr]
        async fn changes_are_broadcast $args {
            let store = $store;
            $crate::store::testing::changes_are_broadcast(store).await;
        }
    };
}

pub async fn create_starts_queued_with_single_entry(store: impl JobStore) {
    let job = store
        .create(NewJob::mock_job().with_text("seed"))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.timeline.len(), 1);
    assert_eq!(job.timeline[0].event, TimelineEvent::Queued);
    assert_eq!(job.extracted_text.as_deref(), Some("seed"));
    assert!(!job.cancel_requested);

    let found = store.find(job.id, &Scope::Any).await.unwrap().unwrap();
    assert_eq!(found.id, job.id);
    assert_eq!(found.status, JobStatus::Queued);
    assert_eq!(found.file_url, job.file_url);
}

pub async fn find_respects_scope(store: impl JobStore) {
    let job = store.create(NewJob::mock_job()).await.unwrap();

    let owner = Scope::Owner(NewJob::DEFAULT_USER.into());
    let stranger = Scope::Owner("intruder".into());
    assert!(store.find(job.id, &owner).await.unwrap().is_some());
    assert!(store.find(job.id, &stranger).await.unwrap().is_none());
}

pub async fn find_unknown_job(store: impl JobStore) {
    assert!(store
        .find(JobId::new(), &Scope::Any)
        .await
        .unwrap()
        .is_none());
}

pub async fn apply_forward_patch(store: impl JobStore) {
    let job = store.create(NewJob::mock_job()).await.unwrap();
    let patch = JobPatch::new()
        .append(TimelineEntry::new(TimelineEvent::ExtractionCompleted, Utc::now()))
        .with_status(JobStatus::Extracted)
        .with_extracted_text("the text")
        .with_stage_progress(100)
        .with_queue_ref("42");

    let Patched { job: patched, outcome } = store.apply(job.id, patch).await.unwrap();

    assert!(outcome.accepted);
    assert!(outcome.status_changed);
    assert_eq!(patched.status, JobStatus::Extracted);

    let found = store.find(job.id, &Scope::Any).await.unwrap().unwrap();
    assert_eq!(found.status, JobStatus::Extracted);
    assert_eq!(found.extracted_text.as_deref(), Some("the text"));
    assert_eq!(found.stage_progress, Some(100));
    assert_eq!(found.queue_ref.as_deref(), Some("42"));
    assert!(found.has_event(&TimelineEvent::ExtractionCompleted));
    assert!(found.updated_at >= job.updated_at);
}

pub async fn apply_rejects_regression(store: impl JobStore) {
    let job = store.create(NewJob::mock_job()).await.unwrap();
    store
        .apply(job.id, JobPatch::new().with_status(JobStatus::Completed).with_summary("done"))
        .await
        .unwrap();

    let Patched { job: patched, outcome } = store
        .apply(
            job.id,
            JobPatch::new()
                .append(TimelineEntry::new(TimelineEvent::ExtractionStarted, Utc::now()))
                .with_status(JobStatus::Processing)
                .with_summary("overwritten"),
        )
        .await
        .unwrap();

    assert!(!outcome.accepted);
    assert_eq!(outcome.rejected, Some(JobStatus::Processing));
    assert_eq!(patched.status, JobStatus::Completed);
    assert_eq!(patched.summary.as_deref(), Some("done"));
    assert!(patched.has_event(&TimelineEvent::ExtractionStarted));
}

pub async fn apply_not_found(store: impl JobStore) {
    let id = JobId::new();
    expect_match!(
        store.apply(id, JobPatch::new().with_stage_progress(5)).await,
        Err(StoreError::JobNotFound(_))
    );
}

pub async fn apply_keeps_timeline_ordered(store: impl JobStore) {
    let job = store.create(NewJob::mock_job()).await.unwrap();
    let stale = job.created_at - chrono::TimeDelta::minutes(5);
    store
        .apply(
            job.id,
            JobPatch::new().append(TimelineEntry::new(TimelineEvent::OcrProgress, stale)),
        )
        .await
        .unwrap();

    let found = store.find(job.id, &Scope::Any).await.unwrap().unwrap();
    assert_eq!(found.timeline.len(), 2);
    assert!(found
        .timeline
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
}

pub async fn request_cancel_queued_job(store: impl JobStore) {
    let job = store.create(NewJob::mock_job()).await.unwrap();
    let cancelled = store.request_cancel(job.id, &Scope::Any).await.unwrap();

    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.cancel_requested);
    assert!(cancelled.has_event(&TimelineEvent::JobCancelled));
}

pub async fn request_cancel_running_job(store: impl JobStore) {
    let job = store.create(NewJob::mock_job()).await.unwrap();
    store
        .apply(job.id, JobPatch::new().with_status(JobStatus::Processing))
        .await
        .unwrap();

    let flagged = store
        .request_cancel(job.id, &Scope::Owner(NewJob::DEFAULT_USER.into()))
        .await
        .unwrap();

    assert_eq!(flagged.status, JobStatus::Processing);
    assert!(flagged.cancel_requested);
    assert!(flagged.has_event(&TimelineEvent::CancelRequested));
    let found = store.find(job.id, &Scope::Any).await.unwrap().unwrap();
    assert!(found.should_cancel());
}

pub async fn request_cancel_finished_job(store: impl JobStore) {
    let job = store.create(NewJob::mock_job()).await.unwrap();
    store
        .apply(job.id, JobPatch::new().with_status(JobStatus::Failed).with_error("boom"))
        .await
        .unwrap();

    expect_match!(
        store.request_cancel(job.id, &Scope::Any).await,
        Err(StoreError::AlreadyFinished {
            status: JobStatus::Failed,
            ..
        })
    );
}

pub async fn request_cancel_other_users_job(store: impl JobStore) {
    let job = store.create(NewJob::mock_job()).await.unwrap();
    expect_match!(
        store
            .request_cancel(job.id, &Scope::Owner("intruder".into()))
            .await,
        Err(StoreError::JobNotFound(_))
    );
    let found = store.find(job.id, &Scope::Any).await.unwrap().unwrap();
    assert!(!found.cancel_requested);
}

pub async fn list_newest_first_and_paginated(store: impl JobStore) {
    let mut created = Vec::new();
    for _ in 0..3 {
        created.push(store.create(NewJob::mock_job()).await.unwrap().id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store
        .create(NewJob::mock_job().with_user("someone-else"))
        .await
        .unwrap();

    let owner = JobFilter::new(Scope::Owner(NewJob::DEFAULT_USER.into()));
    let all: Vec<_> = store
        .list(&owner)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(all, created.iter().rev().copied().collect::<Vec<_>>());
    assert_eq!(store.count(&owner).await.unwrap(), 3);

    let page: Vec<_> = store
        .list(&owner.clone().paginate(1, 1))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(page, vec![created[1]]);
    assert_eq!(store.count(&owner.paginate(1, 1)).await.unwrap(), 3);

    assert_eq!(store.count(&JobFilter::new(Scope::Any)).await.unwrap(), 4);
}

pub async fn list_filters_by_status_and_staleness(store: impl JobStore) {
    let running = store.create(NewJob::mock_job()).await.unwrap();
    store
        .apply(running.id, JobPatch::new().with_status(JobStatus::Processing))
        .await
        .unwrap();
    let queued = store.create(NewJob::mock_job()).await.unwrap();

    let processing = JobFilter::new(Scope::Any).with_statuses([JobStatus::Processing]);
    let found = store.list(&processing).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, running.id);

    let cutoff = Utc::now() + chrono::TimeDelta::seconds(1);
    let stale = store
        .list(&processing.clone().updated_before(cutoff))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);

    let past = queued.created_at - chrono::TimeDelta::minutes(1);
    assert!(store
        .list(&processing.updated_before(past))
        .await
        .unwrap()
        .is_empty());
}

pub async fn changes_are_broadcast(store: impl JobStore) {
    let mut changes = store.subscribe_changes();
    let job = store.create(NewJob::mock_job()).await.unwrap();
    store
        .apply(job.id, JobPatch::new().with_stage_progress(10))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(5), changes.recv()).await {
            Ok(Ok(id)) if id == job.id => seen.push(id),
            Ok(Ok(_)) => {}
            other => panic!("Expected change notifications, got {other:?}"),
        }
    }
}
