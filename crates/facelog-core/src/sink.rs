use crate::types::{Subject, Transaction};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("transaction sink unavailable: {0}")]
    Unavailable(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// Durable record of identity-at-camera events.
///
/// A plain insert is enough: the reconciler's cooldown leases, not the sink,
/// keep the same appearance from being recorded twice.
#[async_trait]
pub trait TransactionSink: Send + Sync {
    async fn record(&self, transaction: &Transaction) -> Result<(), SinkError>;
}

/// Sink that keeps transactions in memory. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<Transaction>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Transaction> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count_for(&self, subject: &Subject) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| &t.subject == subject)
            .count()
    }
}

#[async_trait]
impl TransactionSink for RecordingSink {
    async fn record(&self, transaction: &Transaction) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("recording sink set to fail".into()));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction.clone());
        Ok(())
    }
}
