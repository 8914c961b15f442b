//! A Redis implementation of [`docpipe::queue::Queue`].
//!
//! Each stage gets a pending list and a processing list. Consuming atomically moves an item
//! from the first to the second and acking removes it from the processing list. Releasing moves
//! it back to the consuming end of the pending list, so it is delivered next. Items left in a
//! processing list by a crashed worker are returned with [`RedisQueue::recover`].
use std::time::Duration;

use async_trait::async_trait;
use docpipe::queue::{Delivery, ItemHandle, Queue, QueueError, Stage, WorkItem};
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, ToRedisArgs};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    namespace: NameSpace,
    poll_interval: Duration,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("namespace", &self.namespace.0)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

fn map_err(error: RedisError) -> QueueError {
    if error.is_io_error() || error.is_connection_refusal() || error.is_timeout() {
        QueueError::Unavailable(error.to_string())
    } else {
        tracing::error!(?error, "Unexpected redis error");
        QueueError::BadState
    }
}

impl RedisQueue {
    pub const DEFAULT_NAMESPACE: &'static str = "docpipe";
    const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

    pub async fn from_url(redis_url: &str, namespace: impl ToString) -> Result<Self, QueueError> {
        let client = Client::open(redis_url).map_err(map_err)?;

        Ok(Self {
            conn: ConnectionManager::new(client).await.map_err(map_err)?,
            namespace: NameSpace(namespace.to_string()),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        })
    }

    /// How long `consume` waits between polls of an empty stage.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    async fn next_id(&self) -> Result<u64, QueueError> {
        self.conn
            .clone()
            .incr(self.namespace.id(), 1)
            .await
            .map_err(map_err)
    }

    /// Moves every item stuck in a processing list back to pending.
    ///
    /// Only safe to call while no consumer of this namespace is running.
    #[tracing::instrument(skip(self), fields(namespace = %self.namespace.0))]
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for stage in Stage::ALL {
            loop {
                let moved: Option<String> = self
                    .conn
                    .clone()
                    .rpoplpush(
                        self.namespace.processing(stage),
                        self.namespace.pending(stage),
                    )
                    .await
                    .map_err(map_err)?;
                if moved.is_none() {
                    break;
                }
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "Returned unfinished work items to the queue");
        }
        Ok(recovered)
    }

    /// Number of items waiting in the stage's pending list.
    pub async fn pending_len(&self, stage: Stage) -> Result<usize, QueueError> {
        self.conn
            .clone()
            .llen(self.namespace.pending(stage))
            .await
            .map_err(map_err)
    }

    /// Number of items consumed from the stage but not yet settled.
    pub async fn processing_len(&self, stage: Stage) -> Result<usize, QueueError> {
        self.conn
            .clone()
            .llen(self.namespace.processing(stage))
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn publish(&self, item: &WorkItem) -> Result<ItemHandle, QueueError> {
        let handle = ItemHandle::from(self.next_id().await?.to_string());
        let envelope = serde_json::to_string(&Envelope {
            handle: handle.clone(),
            item: item.clone(),
        })?;
        let _: usize = self
            .conn
            .clone()
            .lpush(self.namespace.pending(item.stage()), envelope)
            .await
            .map_err(map_err)?;
        Ok(handle)
    }

    async fn consume(&self, stage: Stage) -> Result<Delivery, QueueError> {
        loop {
            let receipt: Option<String> = self
                .conn
                .clone()
                .rpoplpush(self.namespace.pending(stage), self.namespace.processing(stage))
                .await
                .map_err(map_err)?;
            let Some(receipt) = receipt else {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            };
            match serde_json::from_str::<Envelope>(&receipt) {
                Ok(Envelope { handle, item }) => {
                    return Ok(Delivery {
                        handle,
                        item,
                        receipt,
                    })
                }
                Err(error) => {
                    tracing::error!(?error, %stage, "Discarding undecodable work item");
                    let _: usize = self
                        .conn
                        .clone()
                        .lrem(self.namespace.processing(stage), 1, &receipt)
                        .await
                        .map_err(map_err)?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let removed: usize = self
            .conn
            .clone()
            .lrem(
                self.namespace.processing(delivery.item.stage()),
                1,
                &delivery.receipt,
            )
            .await
            .map_err(map_err)?;
        if removed == 0 {
            tracing::warn!(handle = %delivery.handle, "Acked work item was not in flight");
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let stage = delivery.item.stage();
        redis::pipe()
            .atomic()
            .lrem(self.namespace.processing(stage), 1, &delivery.receipt)
            .ignore()
            .rpush(self.namespace.pending(stage), &delivery.receipt)
            .ignore()
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err)
    }
}

/// What is stored in the lists.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    handle: ItemHandle,
    item: WorkItem,
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn id(&self) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Id,
        }
    }

    fn pending(&self, stage: Stage) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Pending(stage),
        }
    }

    fn processing(&self, stage: Stage) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Processing(stage),
        }
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType,
}

impl std::fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::Id => write!(f, ":id_counter"),
            KeyType::Pending(stage) => write!(f, ":queue:{}", stage.topic()),
            KeyType::Processing(stage) => write!(f, ":processing:{}", stage.topic()),
        }
    }
}

impl<'a> ToRedisArgs for NameSpacedKey<'a> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType {
    Id,
    Pending(Stage),
    Processing(Stage),
}
