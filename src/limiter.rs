//! Cluster-wide weighted concurrency limiter (§4.1).
//!
//! Bounds the number of simultaneous PVC syncs to a fixed capacity and
//! reports queue-wait duration into a histogram. The returned
//! [`LimiterPermit`] releases its unit on drop, so every successful
//! `acquire` is paired with exactly one release regardless of how the
//! caller's future is cancelled or unwinds — the orchestrator relies on
//! this RAII guarantee rather than a manual `release()` call.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy)]
pub struct LimiterStats {
    pub active: i64,
    pub waiting: i64,
    pub limit: usize,
}

pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
    active: Arc<AtomicI64>,
    waiting: Arc<AtomicI64>,
    metrics: Metrics,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize, metrics: Metrics) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            limit: capacity,
            active: Arc::new(AtomicI64::new(0)),
            waiting: Arc::new(AtomicI64::new(0)),
            metrics,
        }
    }

    /// Builds a fresh instance with a new capacity, sharing the same
    /// metrics handles. Capacity changes are modeled as atomically
    /// replacing the limiter instance (e.g. behind an `Arc` swap at the
    /// call site) rather than mutating a live semaphore in place.
    pub fn with_capacity(&self, capacity: usize) -> Self {
        Self::new(capacity, self.metrics.clone())
    }

    /// Blocks until a unit is free or `cancel` fires. Records
    /// queue-wait duration into the histogram on success.
    pub async fn acquire(
        &self,
        namespace: &str,
        pvc: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<LimiterPermit> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.metrics.set_queue_depth(self.waiting.load(Ordering::SeqCst));
        let started = Instant::now();

        let semaphore = self.semaphore.clone();
        let permit = tokio::select! {
            res = semaphore.acquire_owned() => res,
            _ = cancel.cancelled() => {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                self.metrics.set_queue_depth(self.waiting.load(Ordering::SeqCst));
                return Err(SyncError::Cancelled);
            }
        };

        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.metrics.set_queue_depth(self.waiting.load(Ordering::SeqCst));

        let permit = permit.map_err(|e| SyncError::fatal(anyhow::anyhow!(e)))?;

        self.active.fetch_add(1, Ordering::SeqCst);
        self.metrics.set_concurrent_count(self.active.load(Ordering::SeqCst));
        self.metrics.observe_queue_wait(started.elapsed());

        tracing::debug!(
            namespace,
            pvc,
            waited_ms = started.elapsed().as_millis() as u64,
            "acquired concurrency slot"
        );

        Ok(LimiterPermit {
            _permit: permit,
            active: self.active.clone(),
            metrics: self.metrics.clone(),
        })
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            active: self.active.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            limit: self.limit,
        }
    }
}

/// RAII guard representing one held concurrency unit. Dropping it frees
/// the unit and decrements the active-count gauge.
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicI64>,
    metrics: Metrics,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.set_concurrent_count(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_bounds_active_count_to_capacity() {
        let limiter = ConcurrencyLimiter::new(2, Metrics::new_for_test());
        let cancel = CancellationToken::new();

        let p1 = limiter.acquire("ns", "pvc-1", &cancel).await.unwrap();
        let p2 = limiter.acquire("ns", "pvc-2", &cancel).await.unwrap();
        assert_eq!(limiter.stats().active, 2);

        drop(p1);
        assert_eq!(limiter.stats().active, 1);
        drop(p2);
        assert_eq!(limiter.stats().active, 0);
    }

    #[tokio::test]
    async fn third_acquire_waits_until_a_permit_is_released() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, Metrics::new_for_test()));
        let cancel = CancellationToken::new();

        let permit = limiter.acquire("ns", "pvc-1", &cancel).await.unwrap();
        assert_eq!(limiter.stats().waiting, 0);

        let limiter2 = limiter.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire("ns", "pvc-2", &cancel2).await });

        // Give the waiter a chance to register itself before releasing.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(limiter.stats().waiting, 1);

        drop(permit);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(limiter.stats().active, 1);
        drop(second);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_returns_cancelled_error() {
        let limiter = ConcurrencyLimiter::new(1, Metrics::new_for_test());
        let cancel = CancellationToken::new();
        let _held = limiter.acquire("ns", "pvc-1", &cancel).await.unwrap();

        let blocked_cancel = CancellationToken::new();
        blocked_cancel.cancel();
        let result = limiter.acquire("ns", "pvc-2", &blocked_cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
