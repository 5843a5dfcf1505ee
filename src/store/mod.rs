//! Shared key-value store used to coordinate buckets across processes.
//!
//! Bucket state lives in an external store so that every process using the
//! same namespace draws from one quota. The store is reached through the
//! [`SharedStore`] trait; [`RedisStore`] is the production backend and
//! [`MemoryStore`] keeps everything in-process for tests and single-host use.

mod lock;
mod memory;
mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use self::lock::{acquire_lock, LockOptions, StoreLock};
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Operations the buckets need from the shared store.
///
/// Every method is one network round trip.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read several keys at once. Missing keys come back as `None`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Write several keys at once, all or nothing.
    async fn set_many(&self, entries: &[(String, String)]) -> Result<()>;

    /// Set `name` to `token` if it is not already held, expiring after `lease`.
    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Delete `name` only if it still holds `token`.
    ///
    /// Returns `false` when the lease had already expired or changed hands.
    async fn unlock(&self, name: &str, token: &str) -> Result<bool>;
}

/// Writes queued for a single deferred round trip.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    entries: Vec<(String, String)>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no writes are queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Send every queued write in one round trip.
    pub async fn commit(self, store: &dyn SharedStore) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        store.set_many(&self.entries).await
    }
}
