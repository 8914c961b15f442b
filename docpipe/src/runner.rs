use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    executor::{ExecutionResult, StageExecutor},
    queue::{Delivery, Queue, Stage},
    reporter::ReportError,
};

/// Pause after the queue errors or an item had to be handed back.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Consumes one stage of the queue until cancelled.
///
/// A permit is taken before an item is pulled and held until the item is
/// settled, so items only leave the queue when they can start right away.
pub(crate) struct StageRunner {
    stage: Stage,
    queue: Arc<dyn Queue>,
    executor: Arc<StageExecutor>,
    permits: Arc<Semaphore>,
}

impl StageRunner {
    pub(crate) fn new(
        stage: Stage,
        queue: Arc<dyn Queue>,
        executor: Arc<StageExecutor>,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            stage,
            queue,
            executor,
            permits,
        }
    }

    pub(crate) async fn run(self, cancellation_token: CancellationToken) {
        let span = tracing::info_span!("stage_runner", stage = %self.stage);
        let runner = Arc::new(self);
        async move {
            tracing::debug!("Starting stage runner");
            let mut running = JoinSet::new();
            loop {
                let Some(permit) = runner.acquire(&mut running, &cancellation_token).await else {
                    break;
                };
                let delivery = tokio::select! {
                    delivery = runner.queue.consume(runner.stage) => delivery,
                    _ = cancellation_token.cancelled() => break,
                };
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(error) => {
                        tracing::warn!(?error, "Failed to consume from queue");
                        drop(permit);
                        runner.pause(&cancellation_token).await;
                        continue;
                    }
                };
                let worker = runner.clone();
                let token = cancellation_token.clone();
                running.spawn(
                    async move {
                        if worker.handle(&delivery).await {
                            worker.pause(&token).await;
                        }
                        drop(permit);
                    }
                    .in_current_span(),
                );
            }
            while let Some(joined) = running.join_next().await {
                log_join(joined);
            }
            tracing::debug!("Stage runner stopped");
        }
        .instrument(span)
        .await
    }

    /// Waits for a free permit, reaping finished deliveries meanwhile.
    async fn acquire(
        &self,
        running: &mut JoinSet<()>,
        cancellation_token: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        loop {
            tokio::select! {
                permit = self.permits.clone().acquire_owned() => return permit.ok(),
                Some(joined) = running.join_next() => log_join(joined),
                _ = cancellation_token.cancelled() => return None,
            }
        }
    }

    /// Executes the delivery and settles it with the queue.
    ///
    /// Returns whether the item was handed back for redelivery.
    async fn handle(&self, delivery: &Delivery) -> bool {
        let job_id = delivery.item.job_id;
        match self.executor.execute(&delivery.item).await {
            Ok(result) => {
                match &result {
                    ExecutionResult::Done => tracing::debug!(%job_id, "Stage done"),
                    ExecutionResult::Cancelled => tracing::info!(%job_id, "Stage cancelled"),
                    ExecutionResult::Failed { error } => {
                        tracing::warn!(%job_id, %error, "Stage failed")
                    }
                }
                self.ack(delivery).await;
                false
            }
            Err(ReportError::JobNotFound(_)) => {
                tracing::error!(%job_id, "Dropping work item for unknown job");
                self.ack(delivery).await;
                false
            }
            Err(error) => {
                tracing::error!(%job_id, ?error, "Could not report stage, releasing item");
                self.release(delivery).await;
                true
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        let _ = self.queue.ack(delivery).await.inspect_err(|err| {
            tracing::error!(job_id = %delivery.item.job_id, ?err, "Failed to ack work item");
        });
    }

    async fn release(&self, delivery: &Delivery) {
        let _ = self.queue.release(delivery).await.inspect_err(|err| {
            tracing::error!(job_id = %delivery.item.job_id, ?err, "Failed to release work item");
        });
    }

    async fn pause(&self, cancellation_token: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(RETRY_DELAY) => {},
            _ = cancellation_token.cancelled() => {},
        }
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(error) = joined {
        tracing::error!(?error, "Stage task ended abnormally");
    }
}
