use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use dr_syncer_core::config::EngineConfig;
use dr_syncer_core::limiter::ConcurrencyLimiter;
use dr_syncer_core::metrics::Metrics;
use dr_syncer_core::orchestrator::Orchestrator;
use dr_syncer_core::status::StatusReporter;

/// Builds the long-lived singletons this core needs (limiter, metrics,
/// status reporter, orchestrator) and hands them to whatever drives
/// reconciliation. Enumerating `Mapping`/`RemoteCluster` custom
/// resources and deciding which PVCs are due a sync is the surrounding
/// controller's job, not this crate's (see the engine's scope notes);
/// this binary only proves the core wires together and stays live.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::parse();
    let pod_identity = config.resolve_pod_identity();

    info!(pod_identity, concurrency_limit = config.concurrency_limit, "starting dr-syncer-core");

    let client = Client::try_default().await.context("failed to create Kubernetes client")?;
    let metrics = Metrics::new().context("failed to register Prometheus metrics")?;
    let limiter = Arc::new(ConcurrencyLimiter::new(config.concurrency_limit, metrics.clone()));
    let status = StatusReporter::new(client.clone(), metrics.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        client.clone(),
        client.clone(),
        status,
        config.agent_label_selector.clone(),
        pod_identity,
        Duration::from_secs(config.lock_timeout_minutes * 60),
        Duration::from_secs(config.rsync_pod_ready_timeout_secs),
        Duration::from_secs(config.mount_path_cache_ttl_secs),
    ));

    info!("engine initialized; waiting for reconcile requests");
    let _orchestrator = orchestrator;

    loop {
        let stats = limiter.stats();
        info!(active = stats.active, waiting = stats.waiting, limit = stats.limit, "idle tick");
        tokio::time::sleep(Duration::from_secs(config.reconcile_interval_secs)).await;
    }
}
