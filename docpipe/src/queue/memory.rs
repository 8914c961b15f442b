//! Provides an in memory implementation of [`Queue`].
//!
//! Items live only as long as the process, which makes it suitable for tests
//! and single process development setups.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Delivery, ItemHandle, Queue, QueueError, Stage, WorkItem};

#[derive(Default)]
struct Inner {
    pending: Mutex<HashMap<Stage, VecDeque<(ItemHandle, WorkItem)>>>,
    in_flight: Mutex<HashMap<String, (ItemHandle, WorkItem)>>,
    counter: AtomicU64,
    unavailable: AtomicBool,
    wake: Notify,
}

/// An in memory implementation of [`Queue`].
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with every publish failing as if the broker was down.
    ///
    /// Use [`InMemoryQueue::set_available`] to bring it back.
    pub fn unavailable(self) -> Self {
        self.set_available(false);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Items waiting to be consumed for the stage, oldest first.
    pub fn pending(&self, stage: Stage) -> Vec<WorkItem> {
        self.inner
            .pending
            .lock()
            .map(|pending| {
                pending
                    .get(&stage)
                    .map(|items| items.iter().map(|(_, item)| item.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Number of items consumed but neither acked nor released.
    pub fn in_flight(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .map(|in_flight| in_flight.len())
            .unwrap_or_default()
    }

    fn try_take(&self, stage: Stage) -> Result<Option<Delivery>, QueueError> {
        let Some((handle, item)) = self
            .inner
            .pending
            .lock()
            .map_err(|_| QueueError::BadState)?
            .get_mut(&stage)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        let receipt = format!("{stage}:{handle}:{}", self.next_id());
        self.inner
            .in_flight
            .lock()
            .map_err(|_| QueueError::BadState)?
            .insert(receipt.clone(), (handle.clone(), item.clone()));
        Ok(Some(Delivery {
            handle,
            item,
            receipt,
        }))
    }

    fn push(&self, handle: ItemHandle, item: WorkItem) -> Result<(), QueueError> {
        self.inner
            .pending
            .lock()
            .map_err(|_| QueueError::BadState)?
            .entry(item.stage())
            .or_default()
            .push_back((handle, item));
        self.inner.wake.notify_waiters();
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn publish(&self, item: &WorkItem) -> Result<ItemHandle, QueueError> {
        if self.inner.unavailable.load(Ordering::Relaxed) {
            return Err(QueueError::Unavailable("queue marked unavailable".to_owned()));
        }
        let handle = ItemHandle::from(self.next_id().to_string());
        self.push(handle.clone(), item.clone())?;
        Ok(handle)
    }

    async fn consume(&self, stage: Stage) -> Result<Delivery, QueueError> {
        loop {
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(stage)? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner
            .in_flight
            .lock()
            .map_err(|_| QueueError::BadState)?
            .remove(&delivery.receipt);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let released = self
            .inner
            .in_flight
            .lock()
            .map_err(|_| QueueError::BadState)?
            .remove(&delivery.receipt);
        match released {
            Some((handle, item)) => self.push(handle, item),
            None => Ok(()),
        }
    }
}
