//! Token bucket whose state lives in the shared store.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::bucket::{replenish, BucketRate};
use super::key::BucketKey;
use crate::error::Result;
use crate::store::{acquire_lock, LockOptions, SharedStore, StoreLock, WriteBatch};

/// Parse a stored decimal, treating anything unusable as absent.
fn parse_stored(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// A token bucket persisted in a [`SharedStore`].
///
/// Uses the same replenishment formula as the in-memory `Bucket`, but the
/// capacity and its timestamp are two string keys that any process can read.
/// A bucket whose keys are missing or unreadable is treated as full.
#[derive(Clone)]
pub struct DistributedBucket {
    key: BucketKey,
    rate: BucketRate,
    store: Arc<dyn SharedStore>,
}

impl std::fmt::Debug for DistributedBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedBucket")
            .field("key", &self.key)
            .field("rate", &self.rate)
            .finish()
    }
}

impl DistributedBucket {
    /// Create a bucket handle. Nothing is written until the first
    /// `set_capacity`.
    pub fn new(
        store: Arc<dyn SharedStore>,
        key: BucketKey,
        rate_limit: f64,
        bucket_size: Duration,
    ) -> Self {
        Self {
            key,
            rate: BucketRate::per_minute(rate_limit, bucket_size),
            store,
        }
    }

    /// The bucket's key in the store.
    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    /// Maximum capacity of this bucket.
    pub fn capacity_max(&self) -> f64 {
        self.rate.capacity_max
    }

    /// The two keys read for this bucket, in `[last_checked, capacity]` order.
    pub fn state_keys(&self) -> [String; 2] {
        [self.key.last_checked_key(), self.key.capacity_key()]
    }

    /// Project raw stored values to `now`.
    ///
    /// If either value is missing or malformed the bucket counts as freshly
    /// full at `now`.
    pub fn project(&self, last_checked: Option<&str>, capacity: Option<&str>, now: f64) -> f64 {
        match (parse_stored(last_checked), parse_stored(capacity)) {
            (Some(last_checked), Some(capacity)) => replenish(
                capacity,
                last_checked,
                now,
                self.rate.rate_per_sec,
                self.rate.capacity_max,
            ),
            _ => {
                trace!(bucket = %self.key, "Uninitialized bucket, treating as full");
                self.rate.capacity_max
            }
        }
    }

    /// Capacity projected to `now`, read in one round trip.
    pub async fn get_capacity(&self, now: f64) -> Result<f64> {
        let values = self.store.get_many(&self.state_keys()).await?;
        let last_checked = values.first().and_then(|v| v.as_deref());
        let capacity = values.get(1).and_then(|v| v.as_deref());
        Ok(self.project(last_checked, capacity, now))
    }

    /// Write `capacity` stamped at `now`.
    ///
    /// With a `batch` the writes are only queued, so several buckets can be
    /// committed together; without one they are committed immediately.
    pub async fn set_capacity(
        &self,
        capacity: f64,
        now: f64,
        batch: Option<&mut WriteBatch>,
    ) -> Result<()> {
        debug_assert!(
            (0.0..=self.rate.capacity_max + f64::EPSILON).contains(&capacity),
            "capacity {} outside 0..={}",
            capacity,
            self.rate.capacity_max
        );

        match batch {
            Some(batch) => {
                self.queue_writes(batch, capacity, now);
                Ok(())
            }
            None => {
                let mut batch = WriteBatch::new();
                self.queue_writes(&mut batch, capacity, now);
                batch.commit(self.store.as_ref()).await
            }
        }
    }

    /// Take this bucket's own leased lock.
    pub async fn acquire_lock(&self, options: &LockOptions) -> Result<StoreLock> {
        acquire_lock(self.store.as_ref(), &self.key.lock_key(), options).await
    }

    /// Release a lock obtained from [`acquire_lock`](Self::acquire_lock).
    pub async fn release_lock(&self, lock: StoreLock) -> Result<bool> {
        lock.release(self.store.as_ref()).await
    }

    fn queue_writes(&self, batch: &mut WriteBatch, capacity: f64, now: f64) {
        batch.set(self.key.last_checked_key(), now.to_string());
        batch.set(self.key.capacity_key(), capacity.to_string());
    }
}
