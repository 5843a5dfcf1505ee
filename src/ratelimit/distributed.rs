//! Distributed bucket group backed by the shared store.
//!
//! This module provides the cross-process analog of `BucketGroup`. Each
//! attempt reads every bucket in one round trip and writes every bucket in
//! one atomic batch. Whether attempts from different processes are mutually
//! exclusive is decided by an explicit [`LockPolicy`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::CapacityGroup;
use super::bucket::now_secs;
use super::key::BucketKey;
use super::shared_bucket::DistributedBucket;
use crate::error::Result;
use crate::store::{acquire_lock, LockOptions, SharedStore, WriteBatch};

/// How concurrent attempts against the same buckets are coordinated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Hold one leased lock over all buckets for the whole
    /// read-decide-write sequence. No over-admission across processes.
    Strict,
    /// No lock. Two attempts racing between read and write can both see
    /// enough capacity, so together they may take up to the smaller of the
    /// two amounts beyond capacity. Each writes an absolute capacity and the
    /// later write wins, so the earlier attempt's decrement is lost and can
    /// be admitted again: within one replenishment interval two racers can
    /// exceed capacity by up to the larger of their amounts. One fewer round
    /// trip pair per attempt.
    BestEffort,
}

impl std::fmt::Display for LockPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockPolicy::Strict => write!(f, "strict"),
            LockPolicy::BestEffort => write!(f, "best_effort"),
        }
    }
}

/// A fixed-size ordered group of store-backed buckets.
pub struct DistributedBucketGroup<const N: usize> {
    /// Namespace shared by all cooperating instances
    namespace: String,
    buckets: [DistributedBucket; N],
    store: Arc<dyn SharedStore>,
    policy: LockPolicy,
    lock_options: LockOptions,
}

impl<const N: usize> std::fmt::Debug for DistributedBucketGroup<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedBucketGroup")
            .field("namespace", &self.namespace)
            .field("buckets", &self.buckets)
            .field("policy", &self.policy)
            .field("lock_options", &self.lock_options)
            .finish()
    }
}

impl<const N: usize> DistributedBucketGroup<N> {
    /// Create a group over existing bucket handles.
    pub fn new(
        store: Arc<dyn SharedStore>,
        namespace: &str,
        buckets: [DistributedBucket; N],
        policy: LockPolicy,
        lock_options: LockOptions,
    ) -> Self {
        debug!(
            namespace = %namespace,
            buckets = N,
            policy = %policy,
            "Creating distributed bucket group"
        );
        Self {
            namespace: namespace.to_string(),
            buckets,
            store,
            policy,
            lock_options,
        }
    }

    /// Create a group with one bucket per `(resource, per-minute limit)` pair,
    /// all under `namespace`.
    pub fn from_limits(
        store: Arc<dyn SharedStore>,
        namespace: &str,
        resources: [(&str, f64); N],
        bucket_size: Duration,
        policy: LockPolicy,
        lock_options: LockOptions,
    ) -> Self {
        let buckets = resources.map(|(resource, limit)| {
            DistributedBucket::new(
                store.clone(),
                BucketKey::new(namespace, resource),
                limit,
                bucket_size,
            )
        });
        Self::new(store, namespace, buckets, policy, lock_options)
    }

    /// The coordination policy chosen at construction.
    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// The namespace shared by every bucket in the group.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The buckets in dimension order.
    pub fn buckets(&self) -> &[DistributedBucket; N] {
        &self.buckets
    }

    /// Name of the lock covering the whole group.
    pub fn lock_key(&self) -> String {
        format!("{}:lock", self.namespace)
    }

    /// Projected capacity of every bucket at `now`, read in one round trip.
    pub async fn capacities_at(&self, now: f64) -> Result<[f64; N]> {
        let keys: Vec<String> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.state_keys())
            .collect();
        let values = self.store.get_many(&keys).await?;

        Ok(std::array::from_fn(|i| {
            let last_checked = values.get(2 * i).and_then(|v| v.as_deref());
            let capacity = values.get(2 * i + 1).and_then(|v| v.as_deref());
            self.buckets[i].project(last_checked, capacity, now)
        }))
    }

    /// Attempt to consume `amounts` from every bucket at time `now`.
    pub async fn try_consume_at(&self, amounts: &[f64; N], now: f64) -> Result<bool> {
        self.attempt(amounts, Some(now)).await
    }

    /// One attempt under the configured policy.
    ///
    /// With `now` unset, time is sampled once any lock is held so that a
    /// long lock wait cannot stamp buckets with a stale time.
    async fn attempt(&self, amounts: &[f64; N], now: Option<f64>) -> Result<bool> {
        match self.policy {
            LockPolicy::BestEffort => {
                let now = now.unwrap_or_else(now_secs);
                self.check_and_consume(amounts, now).await
            }
            LockPolicy::Strict => {
                let store = self.store.as_ref();
                let lock = acquire_lock(store, &self.lock_key(), &self.lock_options).await?;
                let now = now.unwrap_or_else(now_secs);

                let outcome = self.check_and_consume(amounts, now).await;

                if let Err(e) = lock.release(store).await {
                    warn!(
                        namespace = %self.namespace,
                        error = %e,
                        "Failed to release group lock; it will expire with its lease"
                    );
                }
                outcome
            }
        }
    }

    /// Read all buckets, decide, and write all buckets back.
    async fn check_and_consume(&self, amounts: &[f64; N], now: f64) -> Result<bool> {
        let projected = self.capacities_at(now).await?;
        let admitted = amounts
            .iter()
            .zip(projected.iter())
            .all(|(amount, capacity)| amount <= capacity);

        // Written on failure too, so accrued replenishment is persisted.
        let mut batch = WriteBatch::new();
        for (i, bucket) in self.buckets.iter().enumerate() {
            let remaining = if admitted {
                projected[i] - amounts[i]
            } else {
                projected[i]
            };
            bucket.set_capacity(remaining, now, Some(&mut batch)).await?;
        }
        batch.commit(self.store.as_ref()).await?;

        trace!(
            namespace = %self.namespace,
            policy = %self.policy,
            admitted = admitted,
            amounts = ?amounts,
            projected = ?projected,
            "Distributed capacity check"
        );

        Ok(admitted)
    }
}

#[async_trait]
impl<const N: usize> CapacityGroup<N> for DistributedBucketGroup<N> {
    async fn try_consume(&self, amounts: &[f64; N]) -> Result<bool> {
        self.attempt(amounts, None).await
    }

    async fn capacities(&self) -> Result<[f64; N]> {
        self.capacities_at(now_secs()).await
    }

    fn capacity_limits(&self) -> [f64; N] {
        std::array::from_fn(|i| self.buckets[i].capacity_max())
    }
}
