//! In-memory flag store for tests and single-process runs.
//!
//! ## Limitations
//!
//! - **Single-process only**: flags are not shared across process boundaries
//! - **No persistence**: all flags are lost when the process exits
//!
//! Expiry is evaluated lazily against an injected [`Clock`], so tests can
//! expire leases deterministically with [`ManualClock::advance`]. Expired
//! entries are swept on insert once the map has doubled since the last sweep.

use super::{FlagStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Monotonic time source, as an offset from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Clock backed by `tokio::time`, so paused-time tests see TTLs advance
/// together with sleeps.
#[derive(Debug)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(PoisonError::into_inner);
        *elapsed += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map size below which inserts never sweep.
const MIN_SWEEP: usize = 64;

#[derive(Debug, Clone)]
struct Flag {
    value: String,
    expires_at: Duration,
}

/// Thread-safe TTL map implementing [`FlagStore`].
pub struct MemoryFlagStore {
    flags: Mutex<HashMap<String, Flag>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    sweep_at: AtomicUsize,
}

impl Default for MemoryFlagStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("flag map lock poisoned".into())
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            flags: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            sweep_at: AtomicUsize::new(MIN_SWEEP),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) flags.
    pub fn live_count(&self) -> usize {
        let now = self.clock.now();
        self.flags
            .lock()
            .map(|flags| flags.values().filter(|f| f.expires_at > now).count())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    /// Entries held, expired or not.
    #[cfg(test)]
    fn stored_len(&self) -> usize {
        self.flags.lock().map(|flags| flags.len()).unwrap_or(0)
    }

    fn insert(
        &self,
        flags: &mut HashMap<String, Flag>,
        key: &str,
        value: &str,
        now: Duration,
        ttl: Duration,
    ) {
        if flags.len() >= self.sweep_at.load(Ordering::Relaxed) {
            flags.retain(|_, f| f.expires_at > now);
            self.sweep_at
                .store((flags.len() * 2).max(MIN_SWEEP), Ordering::Relaxed);
        }
        flags.insert(
            key.to_string(),
            Flag {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
    }

    fn live<'a>(flags: &'a HashMap<String, Flag>, key: &str, now: Duration) -> Option<&'a Flag> {
        flags.get(key).filter(|f| f.expires_at > now)
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut flags = self.flags.lock().map_err(poison_err)?;

        if Self::live(&flags, key, now).is_some() {
            return Ok(false);
        }
        self.insert(&mut flags, key, value, now, ttl);
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let flags = self.flags.lock().map_err(poison_err)?;
        Ok(Self::live(&flags, key, now).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let flags = self.flags.lock().map_err(poison_err)?;
        Ok(Self::live(&flags, key, now).map(|f| f.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut flags = self.flags.lock().map_err(poison_err)?;
        self.insert(&mut flags, key, value, now, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut flags = self.flags.lock().map_err(poison_err)?;
        flags.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_respects_ttl() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryFlagStore::with_clock(clock.clone());

        assert!(store.set_if_absent("k", "1", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_if_absent("k", "2", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));

        clock.advance(Duration::from_secs(10));
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_if_absent("k", "2", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_set_overwrites_and_resets_ttl() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryFlagStore::with_clock(clock.clone());

        store.set("k", "a", Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_secs(4));
        store.set("k", "b", Duration::from_secs(5)).await.unwrap();
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.live_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_flags_swept_on_insert() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryFlagStore::with_clock(clock.clone());

        for i in 0..100 {
            store.set(&format!("old:{i}"), "1", Duration::from_secs(1)).await.unwrap();
        }
        clock.advance(Duration::from_secs(2));
        for i in 0..100 {
            assert!(store
                .set_if_absent(&format!("new:{i}"), "1", Duration::from_secs(60))
                .await
                .unwrap());
        }

        assert_eq!(store.live_count(), 100);
        assert!(store.stored_len() <= 100, "stored {}", store.stored_len());
        assert!(!store.exists("old:0").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_ok() {
        let store = MemoryFlagStore::new();
        store.delete("absent").await.unwrap();
        assert!(!store.exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_store_errors() {
        let store = MemoryFlagStore::new();
        store.set_available(false);
        assert!(matches!(
            store.exists("k").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let store = MemoryFlagStore::new();
        store.set("k", "1", Duration::from_millis(500)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!store.exists("k").await.unwrap());
    }
}
