//! Queue consumer: one message in flight per worker, always acknowledged.
//!
//! Every failure is per-event. Malformed payloads, images without a face,
//! and store outages are logged and acknowledged; nothing is redelivered by
//! the worker itself.

use crate::event::FaceEvent;
use crate::reconcile::{Outcome, ReconcileError, Reconciler};
use crate::types::{Embedding, InvalidVector};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("undecodable image: {0}")]
    InvalidImage(String),
    #[error("degenerate embedding: {0}")]
    InvalidVector(#[from] InvalidVector),
    #[error("embedding backend failed: {0}")]
    Backend(String),
}

/// A message pulled from the queue, to be acknowledged exactly once.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

/// At-least-once work queue.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Next message, or `None` if nothing arrived within the queue's poll interval.
    async fn next(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// Image → normalized face embedding. `None` when no face is found.
#[async_trait]
pub trait EmbeddingSource: Send + Sync {
    async fn embed(&self, image: Vec<u8>) -> Result<Option<Embedding>, EmbedError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidInput,
    NoFaceDetected,
    StoreUnavailable,
    EmbedderFailed,
}

impl DropReason {
    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NoFaceDetected => "no_face_detected",
            Self::StoreUnavailable => "store_unavailable",
            Self::EmbedderFailed => "embedder_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Decided(Outcome),
    Dropped(DropReason),
}

pub struct Worker {
    queue: Arc<dyn EventQueue>,
    embedder: Arc<dyn EmbeddingSource>,
    reconciler: Arc<Reconciler>,
    retry_backoff: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        embedder: Arc<dyn EmbeddingSource>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            queue,
            embedder,
            reconciler,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Pull, decide, acknowledge until shutdown or the queue closes.
    ///
    /// Shutdown is only observed between messages; an in-flight event always
    /// completes. Returns the number of messages handled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut handled = 0u64;
        tracing::info!("worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.queue.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let disposition = self.handle(&delivery.body).await;
                    tracing::trace!(tag = delivery.tag, ?disposition, "message handled");
                    if let Err(err) = self.queue.ack(&delivery).await {
                        tracing::warn!(tag = delivery.tag, error = %err, "ack failed; message may be redelivered");
                    }
                    handled += 1;
                }
                Ok(None) => {}
                Err(QueueError::Closed) => {
                    tracing::info!("queue closed");
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "queue receive failed; backing off");
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }

        tracing::info!(handled, "worker stopped");
        handled
    }

    /// Decode, embed and reconcile one message body.
    pub async fn handle(&self, body: &[u8]) -> Disposition {
        let event = match FaceEvent::decode(body) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "malformed event dropped");
                return self.dropped(DropReason::InvalidInput);
            }
        };
        let camera_id = event.camera_id;

        let embedding = match self.embedder.embed(event.image).await {
            Ok(Some(embedding)) => embedding,
            Ok(None) => {
                tracing::debug!(camera_id = %camera_id, "no face detected");
                return self.dropped(DropReason::NoFaceDetected);
            }
            Err(err @ (EmbedError::InvalidImage(_) | EmbedError::InvalidVector(_))) => {
                tracing::warn!(camera_id = %camera_id, error = %err, "unusable image dropped");
                return self.dropped(DropReason::InvalidInput);
            }
            Err(err) => {
                tracing::error!(camera_id = %camera_id, error = %err, "embedding failed; event dropped");
                return self.dropped(DropReason::EmbedderFailed);
            }
        };

        match self.reconciler.reconcile(&camera_id, &embedding).await {
            Ok(outcome) => Disposition::Decided(outcome),
            Err(ReconcileError::InvalidInput(err)) => {
                tracing::warn!(camera_id = %camera_id, error = %err, "invalid embedding dropped");
                self.dropped(DropReason::InvalidInput)
            }
            Err(err) => {
                tracing::error!(camera_id = %camera_id, error = %err, "reconciliation failed; event acknowledged without retry");
                self.dropped(DropReason::StoreUnavailable)
            }
        }
    }

    fn dropped(&self, reason: DropReason) -> Disposition {
        crate::metrics::record_dropped(reason.label());
        Disposition::Dropped(reason)
    }
}

/// In-process queue over a tokio channel. Closing every sender closes the queue.
pub struct ChannelQueue {
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    next_tag: AtomicU64,
    acked: Mutex<Vec<u64>>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            rx: tokio::sync::Mutex::new(rx),
            next_tag: AtomicU64::new(0),
            acked: Mutex::new(Vec::new()),
        };
        (queue, tx)
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventQueue for ChannelQueue {
    async fn next(&self) -> Result<Option<Delivery>, QueueError> {
        let body = self.rx.lock().await.recv().await.ok_or(QueueError::Closed)?;
        Ok(Some(Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            body,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delivery.tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Coordinator, MemoryFlagStore};
    use crate::index::{GalleryIndex, SimilarityIndex};
    use crate::metrics::MetricsRecorder;
    use crate::reconcile::{ReconcilerConfig, Suppression};
    use crate::sink::RecordingSink;
    use crate::types::test_vectors::axis;
    use crate::types::Subject;

    /// Fake JPEG whose last byte selects the embedding axis; 0xFF means "no face".
    fn image(axis_byte: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, 0xFF, 0xE0, axis_byte]
    }

    struct AxisEmbedder;

    #[async_trait]
    impl EmbeddingSource for AxisEmbedder {
        async fn embed(&self, image: Vec<u8>) -> Result<Option<Embedding>, EmbedError> {
            match image.last().copied() {
                Some(0xFF) => Ok(None),
                Some(0xFE) => Err(EmbedError::Backend("model crashed".into())),
                Some(b) => Ok(Some(axis(b as usize))),
                None => Err(EmbedError::InvalidImage("empty".into())),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryFlagStore>,
        sink: Arc<RecordingSink>,
        queue: Arc<ChannelQueue>,
        tx: mpsc::Sender<Vec<u8>>,
        worker: Worker,
    }

    async fn fixture() -> Fixture {
        let config = ReconcilerConfig::default();
        let store = Arc::new(MemoryFlagStore::new());
        let coordinator = Arc::new(Coordinator::new(store.clone(), config.dedup_ttl, config.camera_lock_ttl));
        let index = Arc::new(GalleryIndex::new());
        index.upsert("alice", &axis(1)).await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let reconciler = Arc::new(Reconciler::new(coordinator, index, sink.clone(), config));
        let (queue, tx) = ChannelQueue::new(16);
        let queue = Arc::new(queue);
        let worker = Worker::new(queue.clone(), Arc::new(AxisEmbedder), reconciler);
        Fixture { store, sink, queue, tx, worker }
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped() {
        let recorder = MetricsRecorder::new();
        let _metrics = metrics::set_default_local_recorder(&recorder);
        let f = fixture().await;
        assert_eq!(
            f.worker.handle(b"not json").await,
            Disposition::Dropped(DropReason::InvalidInput)
        );
        assert_eq!(recorder.snapshot().dropped.get("invalid_input"), Some(&1));
    }

    #[tokio::test]
    async fn test_no_face_dropped() {
        let f = fixture().await;
        let body = FaceEvent::encode("cam1", &image(0xFF)).unwrap();
        assert_eq!(
            f.worker.handle(&body).await,
            Disposition::Dropped(DropReason::NoFaceDetected)
        );
        assert!(f.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_embedder_failure_dropped() {
        let f = fixture().await;
        let body = FaceEvent::encode("cam1", &image(0xFE)).unwrap();
        assert_eq!(
            f.worker.handle(&body).await,
            Disposition::Dropped(DropReason::EmbedderFailed)
        );
    }

    #[tokio::test]
    async fn test_store_outage_dropped_not_retried() {
        let f = fixture().await;
        f.store.set_available(false);
        let body = FaceEvent::encode("cam1", &image(1)).unwrap();
        assert_eq!(
            f.worker.handle(&body).await,
            Disposition::Dropped(DropReason::StoreUnavailable)
        );
    }

    #[tokio::test]
    async fn test_match_decided() {
        let f = fixture().await;
        let body = FaceEvent::encode("cam1", &image(1)).unwrap();
        match f.worker.handle(&body).await {
            Disposition::Decided(Outcome::Matched { identity_id, .. }) => assert_eq!(identity_id, "alice"),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_acks_every_message_until_closed() {
        let recorder = MetricsRecorder::new();
        let _metrics = metrics::set_default_local_recorder(&recorder);
        let f = fixture().await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let match_body = FaceEvent::encode("cam1", &image(1)).unwrap();
        f.tx.send(match_body.clone()).await.unwrap();
        f.tx.send(match_body).await.unwrap();
        f.tx.send(b"{}".to_vec()).await.unwrap();
        f.tx.send(FaceEvent::encode("cam2", &image(0xFF)).unwrap()).await.unwrap();
        drop(f.tx);

        let handled = f.worker.run(shutdown_rx).await;

        assert_eq!(handled, 4);
        assert_eq!(f.queue.acked(), vec![0, 1, 2, 3]);
        assert_eq!(f.sink.count_for(&Subject::Employee("alice".into())), 1);
        let snap = recorder.snapshot();
        assert_eq!(snap.suppressed_for("duplicate_frame"), 1);
        assert_eq!(snap.dropped_total(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let run = f.worker.run(shutdown_rx);
        let stop = async {
            tokio::task::yield_now().await;
            shutdown_tx.send(true).unwrap();
        };
        let (handled, ()) = tokio::join!(run, stop);

        assert_eq!(handled, 0);
        assert!(f.queue.acked().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_suppressed() {
        let f = fixture().await;
        let body = FaceEvent::encode("cam3", &image(7)).unwrap();

        let first = f.worker.handle(&body).await;
        let redelivered = f.worker.handle(&body).await;

        assert!(matches!(first, Disposition::Decided(Outcome::Guessed { .. })));
        assert_eq!(
            redelivered,
            Disposition::Decided(Outcome::Suppressed(Suppression::DuplicateFrame))
        );
    }
}
