//! Cross-cluster PVC data-replication sync engine: lock, provision,
//! locate, transport, verify, annotate, release.

pub mod classify;
pub mod config;
pub mod error;
pub mod limiter;
pub mod lock;
pub mod locator;
pub mod metrics;
pub mod orchestrator;
pub mod podexec;
pub mod retry;
pub mod rsync;
pub mod rsyncpod;
pub mod sshkeys;
pub mod status;
pub mod verify;

pub use error::{SyncError, SyncResult};
pub use orchestrator::{Orchestrator, SyncOperation};
