//! In-process shared store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::SharedStore;
use crate::error::Result;

/// A held lease in the memory store.
#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Shared store kept in process memory.
///
/// Instances sharing one `MemoryStore` (behind an `Arc`) coordinate exactly
/// like processes sharing a Redis server. An optional per-operation latency
/// makes round trips yield to the scheduler, which exposes the same
/// interleavings a real network would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, String>,
    leases: Mutex<HashMap<String, Lease>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    /// Create an empty store with no simulated latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that delays every operation by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Read one raw value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Write one raw value, bypassing any bucket logic.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Number of stored keys (leases excluded).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    async fn round_trip(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.round_trip().await;
        Ok(keys.iter().map(|key| self.get(key)).collect())
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<()> {
        self.round_trip().await;
        for (key, value) in entries {
            self.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        self.round_trip().await;
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if let Some(existing) = leases.get(name) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }

        leases.insert(
            name.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        self.round_trip().await;
        let now = Instant::now();
        let mut leases = self.leases.lock();

        match leases.get(name) {
            Some(lease) if lease.token == token && lease.expires_at > now => {
                leases.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
