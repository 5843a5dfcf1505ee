//! In-memory token bucket with lazy replenishment.

use std::time::Duration;

use chrono::Utc;

/// Current wall-clock time in fractional seconds since the UNIX epoch.
///
/// Wall-clock time (rather than a monotonic clock) is used because bucket
/// timestamps are shared with other processes through the store.
pub fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Project a capacity forward to `now`.
///
/// Elapsed time is clamped at zero so a clock that runs behind the stored
/// timestamp can never drain a bucket.
pub(crate) fn replenish(
    capacity: f64,
    last_checked: f64,
    now: f64,
    rate_per_sec: f64,
    capacity_max: f64,
) -> f64 {
    let elapsed = (now - last_checked).max(0.0);
    (capacity + elapsed * rate_per_sec).clamp(0.0, capacity_max)
}

/// Replenishment parameters shared by local and store-backed buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRate {
    /// Units replenished per second
    pub rate_per_sec: f64,
    /// Maximum capacity (rate times the integration window)
    pub capacity_max: f64,
}

impl BucketRate {
    /// Build from a per-minute limit and an integration window.
    pub fn per_minute(rate_limit: f64, bucket_size: Duration) -> Self {
        let rate_per_sec = rate_limit / 60.0;
        Self {
            rate_per_sec,
            capacity_max: rate_per_sec * bucket_size.as_secs_f64(),
        }
    }
}

/// A single resource's token bucket held in process memory.
///
/// Capacity is never ticked by a timer; every read projects it forward from
/// the last write.
#[derive(Debug, Clone)]
pub struct Bucket {
    rate: BucketRate,
    /// Capacity at `last_checked`
    capacity: f64,
    /// Timestamp of the last write (seconds since epoch)
    last_checked: f64,
}

impl Bucket {
    /// Create a full bucket stamped at `now`.
    pub fn new(rate_limit: f64, bucket_size: Duration, now: f64) -> Self {
        Self::with_rate(BucketRate::per_minute(rate_limit, bucket_size), now)
    }

    /// Create a full bucket from precomputed replenishment parameters.
    pub fn with_rate(rate: BucketRate, now: f64) -> Self {
        Self {
            rate,
            capacity: rate.capacity_max,
            last_checked: now,
        }
    }

    /// Capacity projected to `now`, without mutating the bucket.
    pub fn get_capacity(&self, now: f64) -> f64 {
        replenish(
            self.capacity,
            self.last_checked,
            now,
            self.rate.rate_per_sec,
            self.rate.capacity_max,
        )
    }

    /// Overwrite the stored capacity and its timestamp.
    ///
    /// Callers are responsible for keeping `capacity` within
    /// `0..=capacity_max`.
    pub fn set_capacity(&mut self, capacity: f64, now: f64) {
        debug_assert!(
            (0.0..=self.rate.capacity_max + f64::EPSILON).contains(&capacity),
            "capacity {} outside 0..={}",
            capacity,
            self.rate.capacity_max
        );
        self.capacity = capacity;
        self.last_checked = now;
    }

    /// Maximum capacity of this bucket.
    pub fn capacity_max(&self) -> f64 {
        self.rate.capacity_max
    }

    /// Units replenished per second.
    pub fn rate_per_sec(&self) -> f64 {
        self.rate.rate_per_sec
    }

    /// Timestamp of the last write.
    pub fn last_checked(&self) -> f64 {
        self.last_checked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: f64 = 1_700_000_000.0;

    #[test]
    fn test_bucket_rate_per_minute() {
        let rate = BucketRate::per_minute(120.0, Duration::from_secs(3));
        assert_eq!(rate.rate_per_sec, 2.0);
        assert_eq!(rate.capacity_max, 6.0);
    }

    #[test]
    fn test_new_bucket_is_full() {
        let bucket = Bucket::new(60.0, Duration::from_secs(1), T0);
        assert_eq!(bucket.get_capacity(T0), 1.0);
        assert_eq!(bucket.capacity_max(), 1.0);
        assert_eq!(bucket.last_checked(), T0);
    }

    #[test]
    fn test_capacity_replenishes_up_to_max() {
        let mut bucket = Bucket::new(60.0, Duration::from_secs(2), T0);
        bucket.set_capacity(0.0, T0);

        assert_eq!(bucket.get_capacity(T0 + 0.5), 0.5);
        assert_eq!(bucket.get_capacity(T0 + 1.5), 1.5);
        // Capped at the integration window
        assert_eq!(bucket.get_capacity(T0 + 100.0), 2.0);
    }

    #[test]
    fn test_capacity_stays_within_bounds() {
        let mut bucket = Bucket::new(3500.0, Duration::from_secs(1), T0);
        bucket.set_capacity(0.0, T0);

        for step in 0..200 {
            let t = T0 - 5.0 + step as f64 * 0.05;
            let capacity = bucket.get_capacity(t);
            assert!(capacity >= 0.0, "negative capacity at {}", t);
            assert!(capacity <= bucket.capacity_max(), "overflow at {}", t);
        }
    }

    #[test]
    fn test_replenishment_is_monotonic() {
        let mut bucket = Bucket::new(90_000.0, Duration::from_secs(1), T0);
        bucket.set_capacity(10.0, T0);

        let mut previous = bucket.get_capacity(T0);
        for step in 1..50 {
            let current = bucket.get_capacity(T0 + step as f64 * 0.01);
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn test_read_is_idempotent() {
        let mut bucket = Bucket::new(60.0, Duration::from_secs(1), T0);
        bucket.set_capacity(0.25, T0);

        let first = bucket.get_capacity(T0 + 0.3);
        let second = bucket.get_capacity(T0 + 0.3);
        assert_eq!(first, second);
    }

    #[test]
    fn test_clock_behind_timestamp_does_not_drain() {
        let mut bucket = Bucket::new(60.0, Duration::from_secs(1), T0);
        bucket.set_capacity(0.5, T0);

        assert_eq!(bucket.get_capacity(T0 - 10.0), 0.5);
    }

    #[test]
    fn test_now_secs_is_recent() {
        let now = now_secs();
        // Some time after 2023-11-14
        assert!(now > T0);
    }
}
