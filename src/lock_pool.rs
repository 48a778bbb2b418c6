//! Keyed lock pool with sliding eviction
//!
//! Maps each active key to a single-permit gate so that at most one compute
//! runs per key in this process. The pool must stay bounded under arbitrary
//! key cardinality: entries are ref-counted, idle entries are evicted
//! opportunistically when the last handle returns, and a periodic sweeper
//! catches the long tail.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CacheError;

/// Sweep period floor; sweeping is coarse to amortize the full scan.
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// One key's coordination state.
pub(crate) struct LockEntry {
    /// Single-permit gate serializing recomputes for the key
    gate: Arc<Semaphore>,
    /// Number of outstanding handles referencing this entry
    ref_count: AtomicUsize,
    /// Milliseconds since pool epoch of the most recent rent
    last_used_ms: AtomicU64,
}

impl LockEntry {
    fn new(now_ms: u64) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
            ref_count: AtomicUsize::new(0),
            last_used_ms: AtomicU64::new(now_ms),
        }
    }

    fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_used_ms.load(Ordering::Acquire)))
    }
}

struct PoolInner {
    entries: Mutex<HashMap<String, Arc<LockEntry>>>,
    eviction_window: Duration,
    epoch: Instant,
}

impl PoolInner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Remove `entry` from the map, but only if it is still the current
    /// mapping for `key` and still unreferenced. Another rent may have raced
    /// us here and either be holding the entry or have replaced it; in both
    /// cases the mapping is left alone.
    fn try_evict(&self, key: &str, entry: &Arc<LockEntry>) {
        let mut entries = self.entries.lock();
        let current = match entries.get(key) {
            Some(current) => current,
            None => return,
        };
        if Arc::ptr_eq(current, entry) && entry.ref_count.load(Ordering::Acquire) == 0 {
            entries.remove(key);
            debug!("Evicted idle key lock: {}", key);
        }
    }

    /// Drop every unreferenced entry that has been idle at least the window.
    ///
    /// Rent takes the map lock before touching ref counts, so a zero ref
    /// count observed under the lock cannot be mid-rent.
    fn sweep(&self) {
        let now_ms = self.now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.ref_count.load(Ordering::Acquire) != 0
                || entry.idle_for(now_ms) < self.eviction_window
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Key lock sweep evicted {} idle entries", evicted);
        }
    }
}

/// Pool of per-key gates.
///
/// Rebuilt wholesale on reconfiguration; the sweeper task holds only a weak
/// reference and stops at its next tick once the pool is dropped.
pub(crate) struct KeyLockPool {
    inner: Arc<PoolInner>,
}

impl KeyLockPool {
    /// Create a pool and start its sweeper.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn new(eviction_window: Duration) -> Self {
        let inner = Arc::new(PoolInner {
            entries: Mutex::new(HashMap::new()),
            eviction_window,
            epoch: Instant::now(),
        });

        let weak = Arc::downgrade(&inner);
        let period = eviction_window.max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.sweep(),
                    None => break,
                }
            }
        });

        Self { inner }
    }

    /// Find-or-insert the entry for `key`, reference it and touch its
    /// last-used time. Never fails.
    pub(crate) fn rent(&self, key: &str) -> KeyLockHandle {
        let now_ms = self.inner.now_ms();
        let mut entries = self.inner.entries.lock();
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(LockEntry::new(now_ms)))
            .clone();
        entry.ref_count.fetch_add(1, Ordering::AcqRel);
        entry.last_used_ms.store(now_ms, Ordering::Release);
        drop(entries);

        KeyLockHandle {
            key: key.to_owned(),
            entry,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of pooled entries (idle or referenced).
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    #[cfg(test)]
    fn sweep_now(&self) {
        self.inner.sweep();
    }
}

/// A rented reference to one key's gate.
///
/// Dropping the handle returns it: the ref count drops and, if the entry has
/// been idle at least the eviction window, it is conditionally removed.
pub(crate) struct KeyLockHandle {
    key: String,
    entry: Arc<LockEntry>,
    pool: Arc<PoolInner>,
}

impl KeyLockHandle {
    /// Acquire the gate.
    ///
    /// Returns `Ok(None)` when `timeout` elapses first; `None` timeout waits
    /// indefinitely. Cancellation wins over both.
    pub(crate) async fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, CacheError> {
        let gate = Arc::clone(&self.entry.gate);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            acquired = async {
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, gate.acquire_owned())
                        .await
                        .ok(),
                    None => Some(gate.acquire_owned().await),
                }
            } => {
                // The semaphore is never closed, so a failed acquire can only
                // mean the timeout elapsed.
                Ok(acquired.and_then(|permit| permit.ok()))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_ptr(&self) -> *const LockEntry {
        Arc::as_ptr(&self.entry)
    }
}

impl Drop for KeyLockHandle {
    fn drop(&mut self) {
        let previous = self.entry.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.entry.idle_for(self.pool.now_ms()) >= self.pool.eviction_window {
            self.pool.try_evict(&self.key, &self.entry);
        }
    }
}
