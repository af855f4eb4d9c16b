//! Reliable work queue on Redis lists.
//!
//! Producers `LPUSH` onto `<queue>`. Each worker atomically moves one message
//! into its own `<queue>:processing:<worker_id>` list with `BLMOVE` and removes
//! it there on acknowledge. Anything left in the processing list after a crash
//! is pushed back by [`RedisQueue::recover`] on the next start.

use async_trait::async_trait;
use facelog_core::{Delivery, EventQueue, QueueError};
use redis::aio::MultiplexedConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_QUEUE: &str = "face_images";

fn unavailable(err: redis::RedisError) -> QueueError {
    QueueError::Unavailable(err.to_string())
}

pub fn processing_list(queue: &str, worker_id: &str) -> String {
    format!("{queue}:processing:{worker_id}")
}

pub struct RedisQueue {
    /// Dedicated connection: `BLMOVE` blocks it for up to `poll_timeout`.
    conn: MultiplexedConnection,
    queue: String,
    processing: String,
    poll_timeout: Duration,
    next_tag: AtomicU64,
}

impl RedisQueue {
    pub fn new(conn: MultiplexedConnection, queue: &str, worker_id: &str) -> Self {
        Self {
            conn,
            queue: queue.to_string(),
            processing: processing_list(queue, worker_id),
            poll_timeout: Duration::from_secs(1),
            next_tag: AtomicU64::new(0),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Push everything left in this worker's processing list back onto the
    /// consuming end of the queue. Returns how many messages were re-queued.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0usize;
        loop {
            let body: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if body.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            tracing::warn!(queue = %self.queue, moved, "re-queued unacknowledged messages");
        }
        Ok(moved)
    }

    /// Producer side.
    pub async fn push(&self, body: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl EventQueue for RedisQueue {
    async fn next(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let body: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(self.poll_timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(body.map(|body| Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            body,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&delivery.body)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if removed == 0 {
            tracing::debug!(tag = delivery.tag, "acknowledged message was not in the processing list");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_list_name() {
        assert_eq!(
            processing_list("face_images", "worker-42"),
            "face_images:processing:worker-42"
        );
    }
}
