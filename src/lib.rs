//! rcache - Stampede-resistant read-through caching
//!
//! This library coordinates concurrent reads of a distributed byte cache
//! (Redis, or anything implementing [`CacheBackend`]) so that a missing or
//! expired entry is recomputed by at most one caller per process.
//!
//! The cache supports:
//! - Single-flight recomputation behind a self-evicting per-key lock pool
//! - Stale-while-revalidate and proactive early refresh via a soft-expiry
//!   envelope around stored values
//! - Randomized expiration jitter to decorrelate mass expirations
//! - Bounded lock waits that degrade to stale serves or unstored computes
//! - Bounded-concurrency bulk fan-out over a key vector
//!
//! ## Example
//!
//! ```ignore
//! use rcache::{CacheConfig, MemoryBackend, ReadThroughCache};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = ReadThroughCache::new(MemoryBackend::new(), CacheConfig::default());
//!
//!     let user = cache
//!         .get_or_create("user:123", || async {
//!             // Load from the system of record
//!             Ok("User data".to_owned())
//!         })
//!         .await
//!         .unwrap();
//! }
//! ```

mod codec;
mod config;
mod error;
mod expiration;
mod lock_pool;
mod metrics;
pub mod backend;
mod read_through_cache;

pub use backend::{CacheBackend, MemoryBackend, RedisBackend};
pub use codec::{Cacheable, Codec, JsonCodec};
pub use config::{CacheConfig, CachePolicy};
pub use error::{BoxError, CacheError};
pub use expiration::EntryOptions;
pub use metrics::{DurationSnapshot, MetricsSnapshot};
pub use read_through_cache::{CallOptions, ReadThroughCache};

// Re-export async_trait and the cancellation token for convenience
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
