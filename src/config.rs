//! Cache configuration
//!
//! [`CacheConfig`] holds the process-wide defaults; [`CachePolicy`] carries
//! optional per-call overrides. Every policy field falls through to the
//! config value when unset.

use std::time::Duration;

/// Process-wide configuration for the read-through cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Duration after which a cached value is stale but still serveable
    pub default_soft_ttl: Duration,
    /// Duration after which a cached value must be recomputed before serving
    pub default_hard_ttl: Duration,
    /// Fraction `f` of randomized expiration spread; effective TTLs are drawn
    /// from `[ttl·(1−f), ttl·(1+f)]`. Clamped to `[0, 0.9]` at use.
    pub expiration_jitter_fraction: f64,
    /// Prefix prepended to every key before it reaches the backend.
    /// An empty or whitespace-only prefix is treated as no prefix.
    pub key_prefix: Option<String>,
    /// Idle time after which an unreferenced per-key lock is evicted
    pub key_lock_eviction_window: Duration,
    /// Serialized payloads larger than this are returned but not stored
    pub max_payload_bytes: Option<usize>,
    /// Skip storing values whose encoding is the codec's null form
    /// (e.g. `Option::None` under the JSON codec)
    pub skip_caching_none: bool,
    /// How long a caller waits for the per-key gate before taking the
    /// fallback path. `None` waits indefinitely (subject to cancellation).
    pub lock_wait_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_soft_ttl: Duration::from_secs(300), // 5 minutes
            default_hard_ttl: Duration::from_secs(900), // 15 minutes
            expiration_jitter_fraction: 0.1,
            key_prefix: None,
            key_lock_eviction_window: Duration::from_secs(60),
            max_payload_bytes: None,
            skip_caching_none: false,
            lock_wait_timeout: None,
        }
    }
}

impl CacheConfig {
    /// Build the backend key for a caller-supplied key.
    pub(crate) fn effective_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) if !prefix.trim().is_empty() => format!("{prefix}{key}"),
            _ => key.to_owned(),
        }
    }
}

/// Per-call overrides for the read-through protocol.
///
/// Supplying a policy (even an empty one) switches the call to envelope
/// writes, which is what enables stale-while-revalidate and early refresh
/// for the stored entry. Calls without a policy write plain payloads.
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    /// Override for [`CacheConfig::default_soft_ttl`]
    pub soft_ttl: Option<Duration>,
    /// Override for [`CacheConfig::default_hard_ttl`]
    pub hard_ttl: Option<Duration>,
    /// How far past hard expiry a payload may still be served when the
    /// lock-wait times out. Defaults to zero.
    pub max_stale_on_failure: Option<Duration>,
    /// When the remaining hard lifetime of a fresh hit drops to this window,
    /// a background refresh is started proactively.
    pub early_refresh_window: Option<Duration>,
    /// Override for [`CacheConfig::expiration_jitter_fraction`]
    pub expiration_jitter_fraction: Option<f64>,
    /// Override for [`CacheConfig::lock_wait_timeout`]
    pub lock_wait_timeout: Option<Duration>,
    /// Override for [`CacheConfig::max_payload_bytes`]
    pub max_payload_bytes: Option<usize>,
    /// Override for [`CacheConfig::skip_caching_none`]
    pub skip_caching_none: Option<bool>,
}

/// A policy with every field resolved against the config.
#[derive(Debug, Clone)]
pub(crate) struct EffectivePolicy {
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub max_stale_on_failure: Duration,
    pub early_refresh_window: Option<Duration>,
    pub expiration_jitter_fraction: f64,
    pub lock_wait_timeout: Option<Duration>,
    pub max_payload_bytes: Option<usize>,
    pub skip_caching_none: bool,
}

impl EffectivePolicy {
    pub(crate) fn resolve(policy: Option<&CachePolicy>, config: &CacheConfig) -> Self {
        let empty = CachePolicy::default();
        let policy = policy.unwrap_or(&empty);
        Self {
            soft_ttl: policy.soft_ttl.unwrap_or(config.default_soft_ttl),
            hard_ttl: policy.hard_ttl.unwrap_or(config.default_hard_ttl),
            max_stale_on_failure: policy.max_stale_on_failure.unwrap_or(Duration::ZERO),
            early_refresh_window: policy.early_refresh_window,
            expiration_jitter_fraction: policy
                .expiration_jitter_fraction
                .unwrap_or(config.expiration_jitter_fraction),
            lock_wait_timeout: policy.lock_wait_timeout.or(config.lock_wait_timeout),
            max_payload_bytes: policy.max_payload_bytes.or(config.max_payload_bytes),
            skip_caching_none: policy
                .skip_caching_none
                .unwrap_or(config.skip_caching_none),
        }
    }
}
