//! Stampede-resistant read-through engine
//!
//! This module drives the lookup → serve-or-recompute protocol over the
//! backend:
//!
//! - At most one compute runs per key in this process; concurrent callers
//!   wait on the key's gate and re-check the backend once it opens.
//! - Entries written under a [`CachePolicy`] carry a soft-expiry envelope,
//!   enabling stale-while-revalidate and proactive early refresh.
//! - A bounded lock wait degrades to serving the last known payload, or to
//!   computing for this caller alone without storing.
//! - Undecodable payloads are deleted and recomputed (self-healing).
//!
//! No lock is held across backend I/O on the hit path; the gate guards only
//! double-check + compute + store.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use futures::stream;
use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::CacheBackend;
use crate::codec::{Cacheable, Codec, JsonCodec, encode_envelope, try_decode_envelope};
use crate::config::{CacheConfig, CachePolicy, EffectivePolicy};
use crate::error::{BoxError, CacheError};
use crate::expiration::{EntryOptions, plan_store_options};
use crate::lock_pool::KeyLockPool;
use crate::metrics::{CacheMetrics, MetricsSnapshot};

/// Gate timeout for background refreshes. Losing the race means another
/// refresh is already running, which is exactly as good.
const REFRESH_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-call options for [`ReadThroughCache::get_or_create_with`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Per-call policy; presence switches the write to envelope form,
    /// enabling stale-while-revalidate for the stored entry.
    pub policy: Option<CachePolicy>,
    /// Backend expiration options. When supplied they are used verbatim
    /// (never mutated, no jitter).
    pub entry_options: Option<EntryOptions>,
    /// Cancellation for backend I/O, gate waits and the compute itself.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Options carrying just a policy.
    pub fn with_policy(policy: CachePolicy) -> Self {
        Self {
            policy: Some(policy),
            ..Default::default()
        }
    }
}

/// What a cached payload means right now.
enum Interpretation<T> {
    /// Within soft expiry (or a plain payload, which has no expiry of its
    /// own); `refresh_due` marks a fresh value inside the early-refresh
    /// window.
    Fresh { value: T, refresh_due: bool },
    /// Past soft expiry but within the hard lifetime: serveable while a
    /// background refresh recomputes.
    Stale { value: T },
    /// Past the hard lifetime: must recompute under the gate.
    Expired,
    /// Neither envelope nor plain decode succeeded.
    Corrupt,
}

struct EngineState<C> {
    config: CacheConfig,
    codec: C,
    locks: KeyLockPool,
}

impl<C: Codec> EngineState<C> {
    fn new(config: CacheConfig, codec: C) -> Self {
        let locks = KeyLockPool::new(config.key_lock_eviction_window);
        Self {
            config,
            codec,
            locks,
        }
    }
}

struct EngineInner<B, C> {
    backend: B,
    /// Config + lock pool, republished atomically on reconfigure so readers
    /// never take a lock to observe them.
    state: ArcSwap<EngineState<C>>,
    metrics: CacheMetrics,
}

/// Stampede-resistant read-through cache over a byte-oriented backend.
///
/// Cheap to clone; clones share the backend, configuration and lock pool.
pub struct ReadThroughCache<B, C = JsonCodec> {
    inner: Arc<EngineInner<B, C>>,
}

impl<B, C> Clone for ReadThroughCache<B, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: CacheBackend> ReadThroughCache<B> {
    /// Create a cache with the default JSON codec.
    ///
    /// Must be called within a Tokio runtime (the lock pool starts its
    /// sweeper task here).
    pub fn new(backend: B, config: CacheConfig) -> Self {
        Self::with_codec(backend, config, JsonCodec)
    }
}

impl<B, C> ReadThroughCache<B, C>
where
    B: CacheBackend,
    C: Codec + Clone,
{
    /// Create a cache with a custom codec.
    pub fn with_codec(backend: B, config: CacheConfig, codec: C) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                backend,
                state: ArcSwap::from_pointee(EngineState::new(config, codec)),
                metrics: CacheMetrics::default(),
            }),
        }
    }

    /// Replace the configuration atomically.
    ///
    /// The lock pool is rebuilt alongside it; in-flight calls keep using the
    /// pool they rented from and the old pool is dropped once they finish.
    pub fn configure(&self, mutate: impl FnOnce(&mut CacheConfig)) {
        let current = self.inner.state.load();
        let mut config = current.config.clone();
        mutate(&mut config);
        self.inner
            .state
            .store(Arc::new(EngineState::new(config, current.codec.clone())));
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Get the cached value for `key`, computing and storing it on a miss.
    ///
    /// The payload is written plain (no envelope); use
    /// [`get_or_create_with`](Self::get_or_create_with) with a policy for
    /// stale-while-revalidate semantics.
    pub async fn get_or_create<T, F, Fut>(&self, key: &str, compute: F) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.get_or_create_with(key, compute, CallOptions::default())
            .await
    }

    /// Get the cached value for `key` under explicit per-call options.
    ///
    /// Concurrent callers for the same key produce exactly one compute;
    /// the rest wait on the gate and re-check the backend.
    pub async fn get_or_create_with<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
        call: CallOptions,
    ) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        if key.trim().is_empty() {
            return Err(CacheError::InvalidArgument("key must not be empty"));
        }

        let state = self.inner.state.load_full();
        let effective_key = state.config.effective_key(key);
        let effective = EffectivePolicy::resolve(call.policy.as_ref(), &state.config);
        let policy_enabled = call.policy.is_some();
        let cancel = call.cancel.unwrap_or_default();

        // Fast path: no lock is held across this lookup.
        if let Some(payload) = self.backend_get(&effective_key, &cancel).await? {
            match interpret::<T, C>(&state.codec, &payload, &effective, unix_now_ms()) {
                Interpretation::Fresh { value, refresh_due } => {
                    self.inner.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit for key: {}", effective_key);
                    if refresh_due {
                        debug!("Early refresh window reached for key: {}", effective_key);
                        self.spawn_refresh(state, effective_key, compute, effective);
                    }
                    return Ok(value);
                }
                Interpretation::Stale { value } => {
                    self.inner.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    self.inner.metrics.stale_served.fetch_add(1, Ordering::Relaxed);
                    debug!("Serving stale value while revalidating key: {}", effective_key);
                    self.spawn_refresh(state, effective_key, compute, effective);
                    return Ok(value);
                }
                Interpretation::Expired => {
                    debug!("Cached value expired for key: {}", effective_key);
                }
                Interpretation::Corrupt => {
                    self.remove_corrupt_payload(&effective_key).await;
                }
            }
        } else {
            debug!("Cache miss for key: {}", effective_key);
        }

        self.inner.metrics.misses.fetch_add(1, Ordering::Relaxed);
        self.compute_under_lock(
            &state,
            &effective_key,
            compute,
            &effective,
            call.entry_options.as_ref(),
            policy_enabled,
            &cancel,
        )
        .await
    }

    /// Bounded-concurrency batched get-or-create, preserving input order.
    ///
    /// `compute_per_key` is invoked with the original (unprefixed) key for
    /// every miss. The first failure propagates; computations still queued
    /// or in flight behind it are dropped.
    pub async fn get_or_create_many<T, F, Fut>(
        &self,
        keys: &[String],
        compute_per_key: F,
        max_concurrency: Option<usize>,
        call: CallOptions,
    ) -> Result<Vec<T>, CacheError>
    where
        T: Cacheable,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let degree = max_concurrency
            .unwrap_or_else(num_cpus::get)
            .min(keys.len())
            .max(1);
        let compute_per_key = Arc::new(compute_per_key);

        stream::iter(keys.iter().cloned().map(|key| {
            let compute_per_key = Arc::clone(&compute_per_key);
            let call = call.clone();
            async move {
                let compute_key = key.clone();
                let compute = move || (*compute_per_key)(compute_key);
                self.get_or_create_with(&key, compute, call).await
            }
        }))
        .buffered(degree)
        .try_collect()
        .await
    }

    /// The slow path: serialize recomputes for the key behind its gate.
    async fn compute_under_lock<T, F, Fut>(
        &self,
        state: &Arc<EngineState<C>>,
        effective_key: &str,
        compute: F,
        effective: &EffectivePolicy,
        caller_options: Option<&EntryOptions>,
        policy_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let handle = state.locks.rent(effective_key);
        let wait_started = Instant::now();
        let permit = handle.acquire(effective.lock_wait_timeout, cancel).await?;
        self.inner.metrics.lock_wait.record(wait_started.elapsed());

        let Some(_permit) = permit else {
            return self
                .lock_timeout_fallback(state, effective_key, compute, effective, cancel)
                .await;
        };

        // Double-check: a peer may have populated the entry while we waited.
        if let Some(payload) = self.backend_get(effective_key, cancel).await? {
            match interpret::<T, C>(&state.codec, &payload, effective, unix_now_ms()) {
                Interpretation::Fresh { value, .. } => {
                    debug!("Gate double-check found a fresh value for key: {}", effective_key);
                    return Ok(value);
                }
                Interpretation::Corrupt => {
                    self.remove_corrupt_payload(effective_key).await;
                }
                _ => {}
            }
        }

        let value = self.run_compute(compute, cancel).await?;

        if let Some(payload) =
            storable_payload(&state.codec, &value, effective, policy_enabled, unix_now_ms())?
        {
            let options = plan_store_options(
                caller_options,
                effective.hard_ttl,
                effective.expiration_jitter_fraction,
            );
            self.backend_set(effective_key, payload, &options, cancel).await?;
        }

        Ok(value)
    }

    /// The gate did not open in time. Prefer the last known payload (stale
    /// is acceptable, bounded by `max_stale_on_failure`); otherwise compute
    /// for this caller alone and do not store, leaving the write to the
    /// gate holder.
    async fn lock_timeout_fallback<T, F, Fut>(
        &self,
        state: &Arc<EngineState<C>>,
        effective_key: &str,
        compute: F,
        effective: &EffectivePolicy,
        cancel: &CancellationToken,
    ) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        debug!("Lock wait timed out for key: {}", effective_key);

        if let Some(payload) = self.backend_get(effective_key, cancel).await? {
            if let Some(value) =
                last_known_value::<T, C>(&state.codec, &payload, effective, unix_now_ms())
            {
                self.inner.metrics.stale_served.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
        }

        self.run_compute(compute, cancel).await
    }

    async fn run_compute<T, F, Fut>(
        &self,
        compute: F,
        cancel: &CancellationToken,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = compute() => result.map_err(CacheError::Compute),
        };
        self.inner.metrics.compute.record(started.elapsed());
        result
    }

    /// Fire-and-forget recompute of an envelope entry. Never surfaces
    /// errors and never observes the caller's cancellation.
    fn spawn_refresh<T, F, Fut>(
        &self,
        state: Arc<EngineState<C>>,
        effective_key: String,
        compute: F,
        effective: EffectivePolicy,
    ) where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let handle = state.locks.rent(&effective_key);
            let permit = match handle.acquire(Some(REFRESH_ACQUIRE_TIMEOUT), &cancel).await {
                Ok(Some(permit)) => permit,
                _ => {
                    debug!("Refresh already in flight for key: {}", effective_key);
                    return;
                }
            };

            inner.metrics.refresh_started.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let result = compute().await;
            inner.metrics.compute.record(started.elapsed());

            let value = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        "Background refresh compute failed for key {}: {}. Continuing.",
                        effective_key, err
                    );
                    return;
                }
            };

            // A refresh is only ever triggered by an envelope hit, so the
            // rewrite keeps the envelope form. The caller's entry options do
            // not travel here: the refresh plans its own, with jitter.
            match storable_payload(&state.codec, &value, &effective, true, unix_now_ms()) {
                Ok(Some(payload)) => {
                    let options = plan_store_options(
                        None,
                        effective.hard_ttl,
                        effective.expiration_jitter_fraction,
                    );
                    match inner.backend.set(&effective_key, payload, &options).await {
                        Ok(()) => {
                            inner.metrics.refresh_completed.fetch_add(1, Ordering::Relaxed);
                            debug!("Background refresh stored key: {}", effective_key);
                        }
                        Err(err) => {
                            warn!(
                                "Background refresh store failed for key {}: {}. Continuing.",
                                effective_key, err
                            );
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        "Background refresh encode failed for key {}: {}. Continuing.",
                        effective_key, err
                    );
                }
            }
            drop(permit);
        });
    }

    async fn backend_get(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = self.inner.backend.get(key) => result.map_err(CacheError::Backend),
        }
    }

    async fn backend_set(
        &self,
        key: &str,
        payload: Vec<u8>,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> Result<(), CacheError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = self.inner.backend.set(key, payload, options) => {
                result.map_err(CacheError::Backend)
            }
        }
    }

    /// Best-effort removal of a payload that failed to decode. The entry is
    /// recomputed either way, so a failed delete only delays self-healing.
    async fn remove_corrupt_payload(&self, key: &str) {
        self.inner
            .metrics
            .deserialize_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            "Failed to decode cached payload for key {}. Deleting corrupt entry.",
            key
        );
        if let Err(err) = self.inner.backend.remove(key).await {
            warn!(
                "Failed to delete corrupt entry for key {}: {}. Continuing.",
                key, err
            );
        }
    }
}

/// Classify a payload against the effective TTLs at `now_ms`.
fn interpret<T: Cacheable, C: Codec>(
    codec: &C,
    payload: &[u8],
    effective: &EffectivePolicy,
    now_ms: u64,
) -> Interpretation<T> {
    if let Some(envelope) = try_decode_envelope::<T, C>(codec, payload) {
        let soft = envelope.soft_expire_unix_ms;
        let created = soft.saturating_sub(effective.soft_ttl.as_millis() as u64);
        let hard = created + effective.hard_ttl.as_millis() as u64;

        if now_ms <= soft {
            let refresh_due = effective.early_refresh_window.is_some_and(|window| {
                !window.is_zero() && hard.saturating_sub(now_ms) <= window.as_millis() as u64
            });
            return Interpretation::Fresh {
                value: envelope.value,
                refresh_due,
            };
        }
        if now_ms <= hard {
            return Interpretation::Stale {
                value: envelope.value,
            };
        }
        return Interpretation::Expired;
    }

    match codec.decode::<T>(payload) {
        Ok(value) => Interpretation::Fresh {
            value,
            refresh_due: false,
        },
        Err(_) => Interpretation::Corrupt,
    }
}

/// Decode a payload for the lock-timeout fallback. Envelopes are serveable
/// until `hard + max_stale_on_failure`; plain payloads always are.
fn last_known_value<T: Cacheable, C: Codec>(
    codec: &C,
    payload: &[u8],
    effective: &EffectivePolicy,
    now_ms: u64,
) -> Option<T> {
    if let Some(envelope) = try_decode_envelope::<T, C>(codec, payload) {
        let created = envelope
            .soft_expire_unix_ms
            .saturating_sub(effective.soft_ttl.as_millis() as u64);
        let deadline = created
            + effective.hard_ttl.as_millis() as u64
            + effective.max_stale_on_failure.as_millis() as u64;
        return (now_ms <= deadline).then_some(envelope.value);
    }
    codec.decode::<T>(payload).ok()
}

/// Encode the compute result for storage, or `None` when the result filters
/// say it must not be written (null skip, payload size cap).
fn storable_payload<T: Cacheable, C: Codec>(
    codec: &C,
    value: &T,
    effective: &EffectivePolicy,
    policy_enabled: bool,
    now_ms: u64,
) -> Result<Option<Vec<u8>>, CacheError> {
    let plain = codec.encode(value)?;
    if effective.skip_caching_none && codec.is_null(&plain) {
        debug!("Skipping store of null value");
        return Ok(None);
    }

    let payload = if policy_enabled {
        let soft_expire = now_ms + effective.soft_ttl.as_millis() as u64;
        encode_envelope(codec, value, soft_expire)?
    } else {
        plain
    };

    if effective.max_payload_bytes.is_some_and(|max| payload.len() > max) {
        debug!("Skipping store of oversized payload ({} bytes)", payload.len());
        return Ok(None);
    }
    Ok(Some(payload))
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
