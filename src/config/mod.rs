//! Process-level configuration, loaded once at program start via
//! `clap`: every field is a flag with an `env` fallback, never an
//! ambient global.

pub mod crd;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct EngineConfig {
    /// Cluster-wide concurrency limit on simultaneous PVC syncs.
    #[arg(long, env = "CONCURRENCY_LIMIT", default_value_t = 5)]
    pub concurrency_limit: usize,

    /// PVC lock TTL in minutes before a lock is considered stale.
    #[arg(long, env = "LOCK_TIMEOUT_MINUTES", default_value_t = 60)]
    pub lock_timeout_minutes: u64,

    /// Identity used as lock-owner; falls back to hostname, then a
    /// generated ID, if unset.
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Label selector used to find the node-local agent pods.
    #[arg(
        long,
        env = "AGENT_LABEL_SELECTOR",
        default_value = "app.kubernetes.io/name=dr-syncer-agent"
    )]
    pub agent_label_selector: String,

    /// Timeout waiting for the rsync pod to become ready.
    #[arg(long, env = "RSYNC_POD_READY_TIMEOUT_SECS", default_value_t = 300)]
    pub rsync_pod_ready_timeout_secs: u64,

    /// Mount-path cache TTL, in seconds.
    #[arg(long, env = "MOUNT_PATH_CACHE_TTL_SECS", default_value_t = 3600)]
    pub mount_path_cache_ttl_secs: u64,

    /// Interval between reconcile loops, in seconds.
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    pub reconcile_interval_secs: u64,
}

impl EngineConfig {
    /// Resolves the lock-owner identity: `POD_NAME`, else hostname,
    /// else a generated ID (§6).
    pub fn resolve_pod_identity(&self) -> String {
        self.pod_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| format!("dr-syncer-core-{}", uuid::Uuid::new_v4()))
    }
}
