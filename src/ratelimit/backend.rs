//! Capacity group trait for abstracting local and distributed implementations.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::error::{QuotaError, Result};

/// An ordered group of `N` token buckets with an atomic all-or-nothing
/// check-and-consume.
///
/// This trait abstracts over both the local `BucketGroup` and the
/// `DistributedBucketGroup` so the `RateLimiter` facade can work with either.
/// Waiters are not ordered: a later waiter may be admitted first.
#[async_trait]
pub trait CapacityGroup<const N: usize>: Send + Sync {
    /// Make one admission attempt at the current time.
    ///
    /// Returns `true` when every bucket had capacity and all were decremented,
    /// `false` when none were.
    async fn try_consume(&self, amounts: &[f64; N]) -> Result<bool>;

    /// Current projected capacity of every bucket.
    async fn capacities(&self) -> Result<[f64; N]>;

    /// Maximum capacity of every bucket.
    fn capacity_limits(&self) -> [f64; N];

    /// Poll `try_consume` until it succeeds, sleeping `poll_interval` between
    /// attempts. There is no internal timeout.
    async fn wait_for_capacity(&self, amounts: &[f64; N], poll_interval: Duration) -> Result<()> {
        self.wait_for_capacity_with_shutdown(amounts, poll_interval, std::future::pending::<()>())
            .await
    }

    /// Like [`wait_for_capacity`](Self::wait_for_capacity), but gives up with
    /// [`QuotaError::Cancelled`] once `shutdown` resolves.
    ///
    /// The signal is only observed while sleeping between attempts, so an
    /// attempt that has started always runs to completion.
    async fn wait_for_capacity_with_shutdown<F>(
        &self,
        amounts: &[f64; N],
        poll_interval: Duration,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        warn_if_unsatisfiable(amounts, &self.capacity_limits());
        tokio::pin!(shutdown);

        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            if self.try_consume(amounts).await? {
                debug!(attempts = attempts, amounts = ?amounts, "Capacity acquired");
                return Ok(());
            }

            trace!(
                attempts = attempts,
                amounts = ?amounts,
                poll_interval_ms = poll_interval.as_millis() as u64,
                "Insufficient capacity, sleeping"
            );

            tokio::select! {
                _ = &mut shutdown => {
                    debug!(attempts = attempts, "Wait for capacity cancelled");
                    return Err(QuotaError::Cancelled);
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Like [`wait_for_capacity`](Self::wait_for_capacity), but fails with
    /// [`QuotaError::DeadlineExceeded`] once `deadline` passes.
    async fn wait_for_capacity_until(
        &self,
        amounts: &[f64; N],
        poll_interval: Duration,
        deadline: tokio::time::Instant,
    ) -> Result<()> {
        match self
            .wait_for_capacity_with_shutdown(amounts, poll_interval, tokio::time::sleep_until(deadline))
            .await
        {
            Err(QuotaError::Cancelled) => Err(QuotaError::DeadlineExceeded),
            other => other,
        }
    }

    /// Thread-blocking form of [`wait_for_capacity`](Self::wait_for_capacity).
    ///
    /// The default drives the async loop on a private current-thread runtime,
    /// so it must not be called from inside an async context.
    fn wait_for_capacity_blocking(&self, amounts: &[f64; N], poll_interval: Duration) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.wait_for_capacity(amounts, poll_interval))
    }
}

/// Log once when a request can never fit, since it would poll forever.
pub(crate) fn warn_if_unsatisfiable<const N: usize>(amounts: &[f64; N], limits: &[f64; N]) {
    for (index, (amount, limit)) in amounts.iter().zip(limits.iter()).enumerate() {
        if amount > limit {
            warn!(
                bucket = index,
                amount = amount,
                capacity_max = limit,
                "Requested amount exceeds bucket capacity and can never be admitted"
            );
        }
    }
}
