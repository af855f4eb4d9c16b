//! Lease-based coordination over a shared TTL key-value store.
//!
//! Every flag the reconciler relies on is a key with a time-to-live:
//!
//! - **Leases, not locks**: a crashed worker's flags expire on their own, so
//!   no recovery process is needed. The cost is a bounded window (the TTL)
//!   in which an event may be processed twice.
//! - **Early release**: the camera lock and pending-match marker are deleted
//!   as soon as a decision completes; expiry is only the fallback.
//! - **Store is the source of truth**: workers share nothing but the store.
//!   An in-process watch channel only shortens how quickly a local hold
//!   notices a confirmation.
//!
//! | Key | Purpose |
//! |---|---|
//! | `global:facehash:<fp>` | duplicate-frame suppression |
//! | `camera:lock:<camera_id>` | per-camera in-flight serialization |
//! | `transaction:cooldown:<identity_id>` | per-employee duplicate suppression |
//! | `guess:cooldown:<camera_id>` | per-camera unknown-event suppression |
//! | `wait:match:<camera_id>:<fp>` | ambiguous-hold marker |
//! | `match:confirmed:<camera_id>:<fp>` | cross-path cancellation signal |
//! | `match:confirmed:<camera_id>` | latest confirmation for the camera |

pub mod memory;

use crate::types::Fingerprint;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub use memory::{Clock, ManualClock, MemoryFlagStore, TokioClock};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic primitives the shared store must provide.
///
/// `set_if_absent` must be a single atomic operation (e.g. `SET NX PX`);
/// everything the reconciler guarantees under concurrency rests on it.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Create `key` with a TTL unless it exists. Returns `true` if created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Create or overwrite `key`, resetting its TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Key namespace.
pub mod keys {
    use crate::types::Fingerprint;

    pub fn global_fingerprint(fp: &Fingerprint) -> String {
        format!("global:facehash:{fp}")
    }

    pub fn camera_lock(camera_id: &str) -> String {
        format!("camera:lock:{camera_id}")
    }

    pub fn employee_cooldown(identity_id: &str) -> String {
        format!("transaction:cooldown:{identity_id}")
    }

    pub fn guess_cooldown(camera_id: &str) -> String {
        format!("guess:cooldown:{camera_id}")
    }

    pub fn pending_match(camera_id: &str, fp: &Fingerprint) -> String {
        format!("wait:match:{camera_id}:{fp}")
    }

    pub fn match_confirmed(camera_id: &str, fp: &Fingerprint) -> String {
        format!("match:confirmed:{camera_id}:{fp}")
    }

    pub fn camera_confirmed(camera_id: &str) -> String {
        format!("match:confirmed:{camera_id}")
    }
}

/// Named coordination operations over a [`FlagStore`].
pub struct Coordinator {
    store: Arc<dyn FlagStore>,
    dedup_ttl: Duration,
    camera_lock_ttl: Duration,
    confirmations: watch::Sender<u64>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn FlagStore>, dedup_ttl: Duration, camera_lock_ttl: Duration) -> Self {
        let (confirmations, _) = watch::channel(0);
        Self {
            store,
            dedup_ttl,
            camera_lock_ttl,
            confirmations,
        }
    }

    /// Returns `true` on the first sighting of `fp` within the dedup window
    /// (caller proceeds), `false` for a repeat (caller drops the event).
    pub async fn suppress_duplicate_frame(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&keys::global_fingerprint(fp), "1", self.dedup_ttl)
            .await
    }

    /// `false` means another worker is already deciding for this camera.
    pub async fn acquire_camera_lock(&self, camera_id: &str) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&keys::camera_lock(camera_id), "1", self.camera_lock_ttl)
            .await
    }

    /// Best-effort early release. Failure only means the lease runs to expiry.
    pub async fn release_camera_lock(&self, camera_id: &str) {
        if let Err(err) = self.store.delete(&keys::camera_lock(camera_id)).await {
            tracing::warn!(camera_id, error = %err, "camera lock release failed; lease will expire");
        }
    }

    pub async fn employee_recently_transacted(&self, identity_id: &str) -> Result<bool, StoreError> {
        self.store.exists(&keys::employee_cooldown(identity_id)).await
    }

    /// Atomically take the per-employee cooldown. `false` if already held.
    pub async fn claim_employee_cooldown(
        &self,
        identity_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&keys::employee_cooldown(identity_id), "1", ttl)
            .await
    }

    /// Restart the per-employee cooldown from now.
    pub async fn mark_employee_transacted(
        &self,
        identity_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .set(&keys::employee_cooldown(identity_id), "1", ttl)
            .await
    }

    pub async fn camera_recently_guessed(&self, camera_id: &str) -> Result<bool, StoreError> {
        self.store.exists(&keys::guess_cooldown(camera_id)).await
    }

    /// Atomically take the per-camera guess cooldown. `false` if already held.
    pub async fn claim_guess_cooldown(
        &self,
        camera_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&keys::guess_cooldown(camera_id), "1", ttl)
            .await
    }

    pub async fn mark_camera_guessed(&self, camera_id: &str, ttl: Duration) -> Result<(), StoreError> {
        self.store.set(&keys::guess_cooldown(camera_id), "1", ttl).await
    }

    /// Mark an ambiguous hold. `false` if a hold for this appearance already exists.
    pub async fn begin_pending_match(
        &self,
        camera_id: &str,
        fp: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&keys::pending_match(camera_id, fp), "1", ttl)
            .await
    }

    pub async fn end_pending_match(&self, camera_id: &str, fp: &Fingerprint) {
        if let Err(err) = self.store.delete(&keys::pending_match(camera_id, fp)).await {
            tracing::warn!(camera_id, fingerprint = %fp, error = %err, "pending-match marker cleanup failed");
        }
    }

    /// Whether any confident match was confirmed for this camera recently,
    /// including one for this exact appearance.
    pub async fn match_confirmed(&self, camera_id: &str, fp: &Fingerprint) -> Result<bool, StoreError> {
        if self.store.exists(&keys::match_confirmed(camera_id, fp)).await? {
            return Ok(true);
        }
        self.store.exists(&keys::camera_confirmed(camera_id)).await
    }

    /// Publish a confirmation so concurrent ambiguous holds on this camera cancel.
    pub async fn signal_match_confirmed(
        &self,
        camera_id: &str,
        fp: &Fingerprint,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store
            .set(&keys::match_confirmed(camera_id, fp), "1", ttl)
            .await?;
        self.store
            .set(&keys::camera_confirmed(camera_id), fp.as_str(), ttl)
            .await?;
        self.confirmations.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Wakes whenever this process signals a confirmation.
    pub fn subscribe_confirmations(&self) -> watch::Receiver<u64> {
        self.confirmations.subscribe()
    }
}
