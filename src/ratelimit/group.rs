//! In-process group of buckets with all-or-nothing consumption.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::backend::{warn_if_unsatisfiable, CapacityGroup};
use super::bucket::{now_secs, Bucket};
use crate::error::Result;

/// A fixed-size ordered collection of in-memory buckets.
///
/// The whole check-and-consume step runs under one mutex, so a group can be
/// shared freely between threads and tasks without lost updates. The lock is
/// never held across an await point.
#[derive(Debug)]
pub struct BucketGroup<const N: usize> {
    buckets: Mutex<[Bucket; N]>,
}

impl<const N: usize> BucketGroup<N> {
    /// Create a group from already-built buckets.
    pub fn new(buckets: [Bucket; N]) -> Self {
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Create a group of full buckets from per-minute limits.
    pub fn from_limits(rate_limits: [f64; N], bucket_size: Duration) -> Self {
        let now = now_secs();
        Self::new(rate_limits.map(|limit| Bucket::new(limit, bucket_size, now)))
    }

    /// Attempt to consume `amounts` from every bucket at time `now`.
    ///
    /// Either every bucket is decremented or none is. On failure the
    /// replenishment accrued up to `now` is still written back.
    pub fn try_consume_at(&self, amounts: &[f64; N], now: f64) -> bool {
        let mut buckets = self.buckets.lock();

        let projected: [f64; N] = std::array::from_fn(|i| buckets[i].get_capacity(now));
        let admitted = amounts
            .iter()
            .zip(projected.iter())
            .all(|(amount, capacity)| amount <= capacity);

        for (i, bucket) in buckets.iter_mut().enumerate() {
            let remaining = if admitted {
                projected[i] - amounts[i]
            } else {
                projected[i]
            };
            bucket.set_capacity(remaining, now);
        }

        trace!(
            admitted = admitted,
            amounts = ?amounts,
            projected = ?projected,
            "Local capacity check"
        );

        admitted
    }

    /// Projected capacity of every bucket at `now`.
    pub fn capacities_at(&self, now: f64) -> [f64; N] {
        let buckets = self.buckets.lock();
        std::array::from_fn(|i| buckets[i].get_capacity(now))
    }
}

#[async_trait]
impl<const N: usize> CapacityGroup<N> for BucketGroup<N> {
    async fn try_consume(&self, amounts: &[f64; N]) -> Result<bool> {
        Ok(self.try_consume_at(amounts, now_secs()))
    }

    async fn capacities(&self) -> Result<[f64; N]> {
        Ok(self.capacities_at(now_secs()))
    }

    fn capacity_limits(&self) -> [f64; N] {
        let buckets = self.buckets.lock();
        std::array::from_fn(|i| buckets[i].capacity_max())
    }

    fn wait_for_capacity_blocking(&self, amounts: &[f64; N], poll_interval: Duration) -> Result<()> {
        warn_if_unsatisfiable(amounts, &self.capacity_limits());
        while !self.try_consume_at(amounts, now_secs()) {
            std::thread::sleep(poll_interval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const T0: f64 = 1_700_000_000.0;

    fn group_at<const N: usize>(limits: [f64; N], now: f64) -> BucketGroup<N> {
        BucketGroup::new(limits.map(|limit| Bucket::new(limit, Duration::from_secs(1), now)))
    }

    #[test]
    fn test_single_resource_consume_and_recover() {
        let group = group_at([60.0], T0);

        assert!(group.try_consume_at(&[1.0], T0));
        assert!(!group.try_consume_at(&[1.0], T0));
        assert_eq!(group.capacities_at(T0), [0.0]);

        assert!(group.try_consume_at(&[1.0], T0 + 1.0));
    }

    #[test]
    fn test_consumption_is_conjunctive() {
        // 3500 requests/min and 90000 tokens/min over a 1s window
        let group = group_at([3500.0, 90_000.0], T0);
        let before = group.capacities_at(T0);
        assert_eq!(before[1], 1500.0);

        // Plenty of request capacity, not enough token capacity
        assert!(!group.try_consume_at(&[1.0, 2000.0], T0));
        assert_eq!(group.capacities_at(T0), before);

        assert!(group.try_consume_at(&[1.0, 100.0], T0));
        let after = group.capacities_at(T0);
        assert!((after[0] - (before[0] - 1.0)).abs() < 1e-9);
        assert!((after[1] - 1400.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_attempt_keeps_replenishment() {
        let group = group_at([60.0, 60.0], T0);
        assert!(group.try_consume_at(&[1.0, 1.0], T0));

        // Half a second later only half a unit has accrued
        assert!(!group.try_consume_at(&[1.0, 0.1], T0 + 0.5));
        assert_eq!(group.capacities_at(T0 + 0.5), [0.5, 0.5]);

        // The accrued half is not lost by the failed attempt
        assert!(group.try_consume_at(&[1.0, 0.1], T0 + 1.0));
    }

    #[test]
    fn test_capacity_limits() {
        let group = BucketGroup::from_limits([120.0, 600.0], Duration::from_secs(2));
        assert_eq!(group.capacity_limits(), [4.0, 20.0]);
    }

    #[test]
    fn test_concurrent_threads_never_over_admit() {
        let group = Arc::new(group_at([600.0], T0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let group = Arc::clone(&group);
                std::thread::spawn(move || {
                    (0..10).filter(|_| group.try_consume_at(&[1.0], T0)).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_wait_for_capacity_polls_until_replenished() {
        // 600/min over a 1s window: 10 units, 10 per second
        let group = BucketGroup::from_limits([600.0], Duration::from_secs(1));
        group.wait_for_capacity(&[10.0], Duration::from_millis(10)).await.unwrap();

        let start = std::time::Instant::now();
        group.wait_for_capacity(&[2.0], Duration::from_millis(10)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_wait_for_capacity_cancelled_between_attempts() {
        let group = BucketGroup::from_limits([60.0], Duration::from_secs(1));

        let result = group
            .wait_for_capacity_with_shutdown(
                &[5.0],
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(crate::error::QuotaError::Cancelled)));
    }

    #[tokio::test]
    async fn test_wait_for_capacity_until_deadline() {
        let group = BucketGroup::from_limits([60.0], Duration::from_secs(1));
        group.try_consume(&[1.0]).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
        let result = group
            .wait_for_capacity_until(&[1.0], Duration::from_millis(10), deadline)
            .await;
        assert!(matches!(result, Err(crate::error::QuotaError::DeadlineExceeded)));
    }

    #[test]
    fn test_wait_for_capacity_blocking() {
        let group = BucketGroup::from_limits([600.0], Duration::from_secs(1));
        group
            .wait_for_capacity_blocking(&[10.0], Duration::from_millis(5))
            .unwrap();

        let start = std::time::Instant::now();
        group
            .wait_for_capacity_blocking(&[1.0], Duration::from_millis(5))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
