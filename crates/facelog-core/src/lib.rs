//! facelog-core: identity reconciliation for camera face events.
//!
//! Turns a stream of (camera, face embedding) events into at most one
//! transaction per real-world appearance, coordinating any number of workers
//! through TTL leases in a shared store.

pub mod coordination;
pub mod event;
pub mod index;
pub mod metrics;
pub mod reconcile;
pub mod scoring;
pub mod sink;
pub mod types;
pub mod worker;

pub use coordination::{Coordinator, FlagStore, MemoryFlagStore, StoreError};
pub use event::{EventError, FaceEvent};
pub use index::{GalleryIndex, IndexError, Neighbor, SimilarityIndex};
pub use crate::metrics::{register_metrics, MetricsRecorder, MetricsSnapshot};
pub use reconcile::{Outcome, ReconcileError, Reconciler, ReconcilerConfig, Suppression};
pub use scoring::{Band, Scored, Scorer, Thresholds};
pub use sink::{RecordingSink, SinkError, TransactionSink};
pub use types::{
    CandidateMatch, Embedding, Fingerprint, InvalidVector, Subject, Transaction, EMBEDDING_DIM,
};
pub use worker::{
    ChannelQueue, Delivery, Disposition, DropReason, EmbedError, EmbeddingSource, EventQueue,
    QueueError, Worker,
};
