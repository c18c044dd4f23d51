//! Retry engine (§4.3): a fixed-schedule policy and a
//! CRD-configurable exponential-backoff-with-jitter policy. Both abort
//! immediately when the caller's cancellation token fires, and both only
//! retry errors the caller's closure marks as [`SyncError::Transient`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Per-mapping retry configuration, decoded from the CRD's `retryConfig`
/// block (§6). `backoff_multiplier` arrives over the wire as an
/// integer percent (e.g. `200` means `2.0`); see [`RetryConfig::from_percent`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5 * 60),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Builds a config from the CRD's wire representation, where
    /// `backoff_multiplier_pct` of `200` means a multiplier of `2.0`.
    /// Falls back to [`RetryConfig::default`] fields for any `None`.
    pub fn from_wire(
        max_retries: Option<u32>,
        initial_backoff: Option<Duration>,
        max_backoff: Option<Duration>,
        backoff_multiplier_pct: Option<u32>,
    ) -> Self {
        let default = Self::default();
        Self {
            max_retries: max_retries.unwrap_or(default.max_retries),
            initial_backoff: initial_backoff.unwrap_or(default.initial_backoff),
            max_backoff: max_backoff.unwrap_or(default.max_backoff),
            multiplier: backoff_multiplier_pct
                .map(|pct| pct as f64 / 100.0)
                .unwrap_or(default.multiplier),
        }
    }
}

/// Applies independent jitter of up to ±15% to `base`.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.85..=1.15);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> SyncResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
    }
}

/// Fixed-schedule retry: attempt `k`'s delay (before attempt `k+1`) is
/// `base_backoff * 2^k`, for up to `max_attempts` total invocations of
/// `op`. Only [`SyncError::Transient`] failures are retried; any other
/// error return is propagated immediately.
pub async fn with_retry<T, F, Fut>(
    max_attempts: u32,
    base_backoff: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = base_backoff * 2u32.pow(attempt - 1);
                debug!(attempt, ?delay, "transient failure, retrying");
                sleep_or_cancel(delay, cancel).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// CRD-configured retry: each delay is `min(current * multiplier,
/// max_backoff)` with independent ±15% jitter, up to `cfg.max_retries`
/// total invocations of `op`.
pub async fn with_retry_config<T, F, Fut>(
    cfg: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 0u32;
    let mut current = cfg.initial_backoff;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < cfg.max_retries => {
                let delay = jittered(current);
                warn!(attempt, max = cfg.max_retries, ?delay, "transient failure, backing off");
                sleep_or_cancel(delay, cancel).await?;
                current = std::cmp::min(
                    Duration::from_secs_f64(current.as_secs_f64() * cfg.multiplier),
                    cfg.max_backoff,
                );
            }
            Err(e) => return Err(e),
        }
    }
}
