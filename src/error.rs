//! Error taxonomy shared across the sync engine.
//!
//! The orchestrator (see [`crate::orchestrator`]) distinguishes five kinds of
//! failure (§7): a failure that should be retried by the retry
//! engine, a "not ready" condition that is not actually an error, a fatal
//! run failure, a best-effort cleanup warning, and a recovered panic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A failure whose text matched the transient-error classifier
    /// (§4.3). Eligible for automatic retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Not actually an error: the workflow cannot proceed for a reason
    /// that should be handled as a graceful skip (PVC unmounted, PVC
    /// locked by another controller).
    #[error("not ready: {0}")]
    NotReady(String),

    /// Any non-transient error from a mandatory state. Aborts the
    /// workflow; deferred cleanup still runs.
    #[error("sync failed: {0}")]
    RunFailure(#[source] anyhow::Error),

    /// Failure in a best-effort cleanup/release step. Logged as a
    /// warning; never aborts the run, because the data copy already
    /// succeeded by the time these states run.
    #[error("cleanup warning: {0}")]
    CleanupWarning(#[source] anyhow::Error),

    /// A runtime panic was caught and converted into a run failure.
    #[error("panic during sync: {0}")]
    Panic(String),

    /// The caller's cancellation token fired while an operation was
    /// in flight or queued to retry.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        SyncError::RunFailure(err.into())
    }

    pub fn cleanup(err: impl Into<anyhow::Error>) -> Self {
        SyncError::CleanupWarning(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, SyncError::NotReady(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<kube::Error> for SyncError {
    fn from(e: kube::Error) -> Self {
        SyncError::RunFailure(e.into())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
