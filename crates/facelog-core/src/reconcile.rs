//! Identity reconciliation: one embedding + camera → match, guess, or nothing.
//!
//! Per event:
//!
//! ```text
//! Start ─ dedup? ─ camera lock? ─ score ─┬─ Confident ─ cooldown? ─ record match ─ signal
//!   │          │                          ├─ Ambiguous ─ hold ─┬─ confirmed → drop
//!   drop      drop                        │                    └─ timeout ──┐
//!                                         └─ Rejected ─────────────────────┴─ cooldown? ─ record unknown
//! ```
//!
//! The camera lock covers scoring and the commit of a confident match or an
//! immediate guess. An ambiguous event takes its `wait:match` marker under the
//! lock and then releases it, so a confident frame arriving during the hold
//! can still be decided. After a hold times out, the guess is serialized by
//! the atomic guess-cooldown claim alone.

use crate::coordination::{Coordinator, StoreError};
use crate::index::{IndexError, SimilarityIndex};
use crate::metrics::{
    record_guess_created, record_match_attempt, record_match_duration, record_match_success,
    record_sink_call, record_suppressed,
};
use crate::scoring::{Scored, Scorer, Thresholds};
use crate::sink::TransactionSink;
use crate::types::{CandidateMatch, Embedding, Fingerprint, InvalidVector, Transaction};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InvalidVector),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Tunables for the decision pipeline.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub thresholds: Thresholds,
    /// Neighbors requested from the similarity index.
    pub top_k: usize,
    pub dedup_ttl: Duration,
    pub camera_lock_ttl: Duration,
    pub employee_cooldown: Duration,
    pub guess_cooldown: Duration,
    /// How long an ambiguous decision waits for a confident one.
    pub hold_window: Duration,
    /// Store poll interval while holding.
    pub hold_poll: Duration,
    pub confirm_ttl: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            top_k: 5,
            dedup_ttl: Duration::from_secs(15),
            camera_lock_ttl: Duration::from_secs(20),
            employee_cooldown: Duration::from_secs(60),
            guess_cooldown: Duration::from_secs(60),
            hold_window: Duration::from_millis(1500),
            hold_poll: Duration::from_millis(300),
            confirm_ttl: Duration::from_secs(5),
        }
    }
}

/// Why an event ended without a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Suppression {
    /// Same fingerprint seen within the dedup window.
    DuplicateFrame,
    /// Another worker holds this camera's lock.
    CameraBusy,
    EmployeeCooldown { identity_id: String },
    GuessCooldown,
    /// A confident match on this camera made the ambiguous hold moot.
    SupersededByMatch,
    /// An ambiguous hold for this appearance is already running.
    AlreadyHeld,
}

impl Suppression {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DuplicateFrame => "duplicate_frame",
            Self::CameraBusy => "camera_busy",
            Self::EmployeeCooldown { .. } => "employee_cooldown",
            Self::GuessCooldown => "guess_cooldown",
            Self::SupersededByMatch => "superseded_by_match",
            Self::AlreadyHeld => "already_held",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Matched {
        identity_id: String,
        similarity: f32,
        /// `false` when the sink failed and the event was let through (fail-open).
        recorded: bool,
    },
    Guessed {
        best: Option<CandidateMatch>,
        recorded: bool,
    },
    Suppressed(Suppression),
}

/// What the locked part of the pipeline left to do.
enum Decision {
    Done(Outcome),
    /// Marker taken; wait outside the camera lock.
    Hold(CandidateMatch),
}

pub struct Reconciler {
    coordinator: Arc<Coordinator>,
    index: Arc<dyn SimilarityIndex>,
    sink: Arc<dyn TransactionSink>,
    scorer: Scorer,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        coordinator: Arc<Coordinator>,
        index: Arc<dyn SimilarityIndex>,
        sink: Arc<dyn TransactionSink>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            coordinator,
            index,
            sink,
            scorer: Scorer::new(config.thresholds),
            config,
        }
    }

    /// Validate a raw embedding, then reconcile it.
    ///
    /// Degenerate vectors fail here and never reach the index or the sink.
    pub async fn reconcile_values(
        &self,
        camera_id: &str,
        values: Vec<f32>,
    ) -> Result<Outcome, ReconcileError> {
        let embedding = Embedding::normalized(values)?;
        self.reconcile(camera_id, &embedding).await
    }

    pub async fn reconcile(
        &self,
        camera_id: &str,
        embedding: &Embedding,
    ) -> Result<Outcome, ReconcileError> {
        let outcome = self.run(camera_id, embedding).await?;
        if let Outcome::Suppressed(reason) = &outcome {
            record_suppressed(reason.label());
        }
        Ok(outcome)
    }

    async fn run(&self, camera_id: &str, embedding: &Embedding) -> Result<Outcome, ReconcileError> {
        let fingerprint = embedding.fingerprint();

        if !self.coordinator.suppress_duplicate_frame(&fingerprint).await? {
            tracing::debug!(camera_id, fingerprint = %fingerprint, "duplicate frame suppressed");
            return Ok(Outcome::Suppressed(Suppression::DuplicateFrame));
        }

        if !self.coordinator.acquire_camera_lock(camera_id).await? {
            tracing::debug!(camera_id, fingerprint = %fingerprint, "camera busy; event dropped");
            return Ok(Outcome::Suppressed(Suppression::CameraBusy));
        }

        let decision = self.decide(camera_id, embedding, &fingerprint).await;
        self.coordinator.release_camera_lock(camera_id).await;

        match decision? {
            Decision::Done(outcome) => Ok(outcome),
            Decision::Hold(candidate) => self.hold_then_guess(camera_id, &fingerprint, candidate).await,
        }
    }

    /// Runs under the camera lock.
    async fn decide(
        &self,
        camera_id: &str,
        embedding: &Embedding,
        fingerprint: &Fingerprint,
    ) -> Result<Decision, ReconcileError> {
        record_match_attempt();
        let started = Instant::now();
        let neighbors = self.index.top_k(embedding, self.config.top_k).await?;
        let scored = self.scorer.evaluate(&neighbors);
        record_match_duration(started.elapsed());

        tracing::debug!(
            camera_id,
            fingerprint = %fingerprint,
            band = ?scored.band(),
            best = ?scored.best(),
            "scored"
        );

        match scored {
            Scored::Confident(candidate) => self
                .commit_match(camera_id, fingerprint, candidate)
                .await
                .map(Decision::Done),
            Scored::Ambiguous(candidate) => {
                if self
                    .coordinator
                    .begin_pending_match(camera_id, fingerprint, self.config.hold_window)
                    .await?
                {
                    Ok(Decision::Hold(candidate))
                } else {
                    tracing::debug!(camera_id, fingerprint = %fingerprint, "hold already pending for appearance");
                    Ok(Decision::Done(Outcome::Suppressed(Suppression::AlreadyHeld)))
                }
            }
            Scored::Rejected(best) => self.commit_guess(camera_id, best).await.map(Decision::Done),
        }
    }

    async fn commit_match(
        &self,
        camera_id: &str,
        fingerprint: &Fingerprint,
        candidate: CandidateMatch,
    ) -> Result<Outcome, ReconcileError> {
        let identity_id = candidate.identity_id;
        let cooldown = self.config.employee_cooldown;

        // The read is the cheap common case; the claim closes the race between
        // workers deciding for the same person on different cameras.
        if self.coordinator.employee_recently_transacted(&identity_id).await?
            || !self.coordinator.claim_employee_cooldown(&identity_id, cooldown).await?
        {
            tracing::debug!(camera_id, identity_id = %identity_id, "recent transaction for employee; skipping");
            return Ok(Outcome::Suppressed(Suppression::EmployeeCooldown { identity_id }));
        }

        let recorded = self
            .record(&Transaction::matched(&identity_id, camera_id))
            .await;

        // Past the sink, store failures are logged only; the claimed cooldown
        // still guards against a second record.
        if let Err(err) = self
            .coordinator
            .mark_employee_transacted(&identity_id, cooldown)
            .await
        {
            tracing::warn!(camera_id, identity_id = %identity_id, error = %err, "employee cooldown refresh failed");
        }
        if let Err(err) = self
            .coordinator
            .signal_match_confirmed(camera_id, fingerprint, self.config.confirm_ttl)
            .await
        {
            tracing::warn!(camera_id, identity_id = %identity_id, error = %err, "match confirmation not published");
        }

        if recorded {
            record_match_success();
        }
        tracing::info!(
            camera_id,
            identity_id = %identity_id,
            similarity = candidate.similarity,
            recorded,
            "match transaction"
        );

        Ok(Outcome::Matched {
            identity_id,
            similarity: candidate.similarity,
            recorded,
        })
    }

    /// Runs after the camera lock is released, with the pending marker held.
    async fn hold_then_guess(
        &self,
        camera_id: &str,
        fingerprint: &Fingerprint,
        candidate: CandidateMatch,
    ) -> Result<Outcome, ReconcileError> {
        let confirmed = self.await_confirmation(camera_id, fingerprint).await;
        self.coordinator.end_pending_match(camera_id, fingerprint).await;

        if confirmed? {
            tracing::debug!(
                camera_id,
                identity_id = %candidate.identity_id,
                similarity = candidate.similarity,
                "ambiguous decision superseded by confirmed match"
            );
            return Ok(Outcome::Suppressed(Suppression::SupersededByMatch));
        }

        self.commit_guess(camera_id, Some(candidate)).await
    }

    /// Bounded wait for a match confirmation on this camera.
    ///
    /// Polls the shared store every `hold_poll` (confirmations from other
    /// workers) and wakes early on in-process confirmations.
    async fn await_confirmation(
        &self,
        camera_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StoreError> {
        let mut local = self.coordinator.subscribe_confirmations();
        let deadline = Instant::now() + self.config.hold_window;

        loop {
            if self.coordinator.match_confirmed(camera_id, fingerprint).await? {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = self.config.hold_poll.min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = local.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
    }

    async fn commit_guess(
        &self,
        camera_id: &str,
        best: Option<CandidateMatch>,
    ) -> Result<Outcome, ReconcileError> {
        let cooldown = self.config.guess_cooldown;

        if self.coordinator.camera_recently_guessed(camera_id).await?
            || !self.coordinator.claim_guess_cooldown(camera_id, cooldown).await?
        {
            tracing::debug!(camera_id, "recent unknown transaction for camera; skipping");
            return Ok(Outcome::Suppressed(Suppression::GuessCooldown));
        }

        let recorded = self.record(&Transaction::unknown(camera_id)).await;
        if let Err(err) = self.coordinator.mark_camera_guessed(camera_id, cooldown).await {
            tracing::warn!(camera_id, error = %err, "guess cooldown refresh failed");
        }

        if recorded {
            record_guess_created();
        }
        tracing::info!(
            camera_id,
            nearest = best.as_ref().map(|c| c.identity_id.as_str()),
            similarity = best.as_ref().map(|c| c.similarity),
            recorded,
            "unknown transaction"
        );

        Ok(Outcome::Guessed { best, recorded })
    }

    /// Fail-open: a sink failure is logged and the decision still stands.
    async fn record(&self, transaction: &Transaction) -> bool {
        match self.sink.record(transaction).await {
            Ok(()) => {
                record_sink_call(true);
                true
            }
            Err(err) => {
                record_sink_call(false);
                tracing::warn!(
                    camera_id = %transaction.camera_id,
                    subject = %transaction.subject,
                    error = %err,
                    "transaction sink failed; event acknowledged without record"
                );
                false
            }
        }
    }
}
