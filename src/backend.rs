//! Cache backend interface and adapters
//!
//! The engine consumes an opaque byte-oriented KV store through
//! [`CacheBackend`]. Two adapters ship with the crate:
//!
//! - [`RedisBackend`]: Redis via a multiplexed connection manager (shared
//!   across instances)
//! - [`MemoryBackend`]: an in-process map, for tests and single-process use

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BoxError;
use crate::expiration::EntryOptions;

/// Opaque distributed KV store consumed by the engine.
///
/// Implementations must be safe for concurrent use; the engine never holds a
/// lock across these calls on the hit path.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch the payload for `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError>;

    /// Store `payload` under `key` with the given expiration options.
    async fn set(
        &self,
        key: &str,
        payload: Vec<u8>,
        options: &EntryOptions,
    ) -> Result<(), BoxError>;

    /// Delete the payload for `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), BoxError>;
}

#[async_trait]
impl<B: CacheBackend> CacheBackend for Arc<B> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError> {
        (**self).get(key).await
    }

    async fn set(
        &self,
        key: &str,
        payload: Vec<u8>,
        options: &EntryOptions,
    ) -> Result<(), BoxError> {
        (**self).set(key, payload, options).await
    }

    async fn remove(&self, key: &str) -> Result<(), BoxError> {
        (**self).remove(key).await
    }
}

/// Redis-backed store.
///
/// Expirations map to `PX`: both relative and absolute options become a TTL
/// from the write; sliding expiration is approximated as a TTL from the last
/// write (Redis has no per-read touch without an options-aware read path).
#[derive(Clone)]
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect a manager-backed client.
    pub async fn connect(client: redis::Client) -> Result<Self, redis::RedisError> {
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError> {
        let mut conn = self.conn.clone();
        let payload = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn set(
        &self,
        key: &str,
        payload: Vec<u8>,
        options: &EntryOptions,
    ) -> Result<(), BoxError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if let Some(ttl) = options.time_to_live() {
            // PX 0 is rejected by Redis; clamp to the smallest expiring TTL.
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BoxError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

struct StoredEntry {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
    sliding: Option<Duration>,
}

/// In-process backend over a plain map.
///
/// Honors absolute, relative and sliding expiration. Cheap to clone; clones
/// share the same store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at.is_none_or(|at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(None);
        };

        let now = Instant::now();
        if entry.expires_at.is_some_and(|at| at <= now) {
            entries.remove(key);
            return Ok(None);
        }
        if let Some(sliding) = entry.sliding {
            entry.expires_at = Some(now + sliding);
        }
        Ok(Some(entry.payload.clone()))
    }

    async fn set(
        &self,
        key: &str,
        payload: Vec<u8>,
        options: &EntryOptions,
    ) -> Result<(), BoxError> {
        let expires_at = options.time_to_live().map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(
            key.to_owned(),
            StoredEntry {
                payload,
                expires_at,
                sliding: options.sliding_expiration,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BoxError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
