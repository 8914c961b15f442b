//! Test suite for ensuring a correct implementation of a [`Queue`].
//!
//! Brokers invoke [`queue_test_suite!`](crate::queue_test_suite) from their own test module.
use std::time::Duration;

use super::*;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(100);

#[macro_export]
macro_rules! queue_test_suite {
    (for: $queue:expr) => {
        $crate::queue_test_suite!(attr: tokio::test, args: (), queue: $queue);
    };
    (attr: $attr:meta, args: $args:tt, queue: $queue:expr) => {
        #[$attr]
        async fn publish_then_consume $args {
            let queue = $queue;
            $crate::queue::testing::publish_then_consume(queue).await;
        }
        #[$attr]
        async fn stages_do_not_share_items $args {
            let queue = $queue;
            $crate::queue::testing::stages_do_not_share_items(queue).await;
        }
        #[$attr]
        async fn acked_item_is_gone $args {
            let queue = $queue;
            $crate::queue::testing::acked_item_is_gone(queue).await;
        }
        #[$attr]
        async fn released_item_comes_back $args {
            let queue = $queue;
            $crate::queue::testing::released_item_comes_back(queue).await;
        }
        #[$attr]
        async fn abandoned_consume_loses_nothing $args {
            let queue = $queue;
            $crate::queue::testing::abandoned_consume_loses_nothing(queue).await;
        }
    };
}

async fn next(queue: &impl Queue, stage: Stage) -> Delivery {
    tokio::time::timeout(DELIVERY_TIMEOUT, queue.consume(stage))
        .await
        .unwrap_or_else(|_| panic!("Nothing delivered for {stage}"))
        .unwrap()
}

async fn assert_nothing_for(queue: &impl Queue, stage: Stage) {
    if let Ok(delivery) = tokio::time::timeout(QUIET_PERIOD, queue.consume(stage)).await {
        panic!("Unexpected delivery for {stage}: {delivery:?}");
    }
}

pub async fn publish_then_consume(queue: impl Queue) {
    let item = WorkItem::extraction(JobId::new(), "https://files.example.com/scan.pdf");

    let handle = queue.publish(&item).await.unwrap();
    let delivery = next(&queue, Stage::Extraction).await;

    assert_eq!(delivery.handle, handle);
    assert_eq!(delivery.item, item);
    queue.ack(&delivery).await.unwrap();
}

pub async fn stages_do_not_share_items(queue: impl Queue) {
    let item = WorkItem::summarization(JobId::new(), "some text");
    queue.publish(&item).await.unwrap();

    assert_nothing_for(&queue, Stage::Extraction).await;

    let delivery = next(&queue, Stage::Summarization).await;
    assert_eq!(delivery.item, item);
    queue.ack(&delivery).await.unwrap();
}

pub async fn acked_item_is_gone(queue: impl Queue) {
    queue
        .publish(&WorkItem::extraction(JobId::new(), "https://x/y.pdf"))
        .await
        .unwrap();

    let delivery = next(&queue, Stage::Extraction).await;
    queue.ack(&delivery).await.unwrap();

    assert_nothing_for(&queue, Stage::Extraction).await;
}

pub async fn released_item_comes_back(queue: impl Queue) {
    let item = WorkItem::extraction(JobId::new(), "https://x/y.pdf");
    queue.publish(&item).await.unwrap();

    let first = next(&queue, Stage::Extraction).await;
    queue.release(&first).await.unwrap();
    let second = next(&queue, Stage::Extraction).await;

    assert_eq!(second.handle, first.handle);
    assert_eq!(second.item, item);
    queue.ack(&second).await.unwrap();
}

pub async fn abandoned_consume_loses_nothing(queue: impl Queue) {
    assert_nothing_for(&queue, Stage::Summarization).await;

    let item = WorkItem::summarization(JobId::new(), "some text");
    queue.publish(&item).await.unwrap();

    let delivery = next(&queue, Stage::Summarization).await;
    assert_eq!(delivery.item, item);
    queue.ack(&delivery).await.unwrap();
}
