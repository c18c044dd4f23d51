//! Workflow Orchestrator (§4.9): the 13-state machine that ties
//! every other component together for one (source PVC → destination
//! PVC) sync, with deferred cleanup and panic recovery.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::crd::{Mapping, RemoteCluster};
use crate::error::{SyncError, SyncResult};
use crate::limiter::ConcurrencyLimiter;
use crate::lock::{LockOutcome, PvcLock};
use crate::locator::{MountPathCache, SourceLocator};
use crate::podexec;
use crate::retry::with_retry_config;
use crate::rsync::{RsyncExecutor, RsyncRequest};
use crate::rsyncpod::{RsyncPodHandle, RsyncPodManager};
use crate::sshkeys::{
    self, append_authorized_key, generate_keypair, install_private_key_command, KeyPair, KeySource,
};
use crate::status::{EventReason, StatusReporter, SyncPhase, SyncStatus};
use crate::verify::{
    resolve_policy, ClusterVerificationDefaults, MappingVerificationDefaults, PvcVerificationOverride,
};

const SSH_CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Transient, one per in-flight PVC copy (§3). Created at
/// orchestrator entry, destroyed at exit; never persisted.
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub sync_id: String,
    pub source_namespace: String,
    pub source_pvc: String,
    pub dest_namespace: String,
    pub dest_pvc: String,
    pub lock_acquired: bool,
    pub rsync_pod_handle: Option<RsyncPodHandle>,
    pub start_time: DateTime<Utc>,
    pub attempt: u32,
}

impl SyncOperation {
    fn new(source_namespace: &str, source_pvc: &str, dest_namespace: &str, dest_pvc: &str) -> Self {
        let start_time = Utc::now();
        Self {
            sync_id: format!("{source_pvc}-{}", start_time.timestamp_millis()),
            source_namespace: source_namespace.to_string(),
            source_pvc: source_pvc.to_string(),
            dest_namespace: dest_namespace.to_string(),
            dest_pvc: dest_pvc.to_string(),
            lock_acquired: false,
            rsync_pod_handle: None,
            start_time,
            attempt: 0,
        }
    }
}

pub struct Orchestrator {
    source_client: Client,
    dest_client: Client,
    lock: PvcLock,
    rsync_pod_manager: RsyncPodManager,
    locator: SourceLocator,
    rsync_executor: RsyncExecutor,
    status: StatusReporter,
    pod_identity: String,
    rsync_pod_ready_timeout: Duration,
    mount_path_cache_ttl: Duration,
}

impl Orchestrator {
    /// `source_client`/`dest_client` may be the same cluster, but are
    /// modeled as distinct handles since a mapping's source and
    /// destination namespaces may live on different clusters (§1).
    pub fn new(
        source_client: Client,
        dest_client: Client,
        status: StatusReporter,
        agent_label_selector: impl Into<String>,
        pod_identity: impl Into<String>,
        lock_ttl: Duration,
        rsync_pod_ready_timeout: Duration,
        mount_path_cache_ttl: Duration,
    ) -> Self {
        Self {
            lock: PvcLock::new(source_client.clone(), lock_ttl),
            rsync_pod_manager: RsyncPodManager::new(dest_client.clone()),
            locator: SourceLocator::new(source_client.clone(), agent_label_selector),
            rsync_executor: RsyncExecutor::new(dest_client.clone()),
            source_client,
            dest_client,
            status,
            pod_identity: pod_identity.into(),
            rsync_pod_ready_timeout,
            mount_path_cache_ttl,
        }
    }

    /// Runs one complete sync workflow for `source_pvc` → `dest_pvc`.
    /// Acquires a concurrency slot for the duration of the call; the
    /// slot (and every resource the workflow itself provisions) is
    /// released before this returns, success or failure.
    pub async fn run_workflow(
        &self,
        limiter: &ConcurrencyLimiter,
        mapping: &Mapping,
        remote_cluster: &RemoteCluster,
        source_namespace: &str,
        source_pvc: &str,
        dest_namespace: &str,
        dest_pvc: &str,
        key_source: KeySource,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let _permit = limiter.acquire(source_namespace, source_pvc, cancel).await?;
        let mut op = SyncOperation::new(source_namespace, source_pvc, dest_namespace, dest_pvc);

        let outcome = AssertUnwindSafe(self.drive_states(&mut op, mapping, remote_cluster, key_source, cancel))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(inner) => inner,
            Err(panic_payload) => {
                let message = panic_message(&panic_payload);
                error!(sync_id = %op.sync_id, panic = %message, "workflow panicked");
                Err(SyncError::Panic(message))
            }
        };

        self.finalize(&mut op, result).await
    }

    /// States 0 through 11 (§4.9). Returns `Ok(Skip)` for the two
    /// graceful-skip paths (lock held, PVC unmounted) and `Ok(Done(_))`
    /// on a completed sync; any `Err` is a `RunFailure`-class failure.
    async fn drive_states(
        &self,
        op: &mut SyncOperation,
        mapping: &Mapping,
        remote_cluster: &RemoteCluster,
        key_source: KeySource,
        cancel: &CancellationToken,
    ) -> SyncResult<WorkflowOutcome> {
        self.status.emit_event(&op.source_namespace, &op.source_pvc, "", EventReason::SyncStarted).await;
        self.write_status(op, SyncStatus::initializing(op.start_time)).await?;

        // State 0: lock.
        match self.lock.acquire(&op.source_namespace, &op.source_pvc, &self.pod_identity).await {
            Ok(LockOutcome::Acquired(_)) => {
                op.lock_acquired = true;
                self.status.emit_event(&op.source_namespace, &op.source_pvc, "", EventReason::LockAcquired).await;
            }
            Ok(LockOutcome::Held(held)) => {
                info!(sync_id = %op.sync_id, held_by = %held.owner, "PVC locked by another controller, skipping");
                return Ok(WorkflowOutcome::Skipped);
            }
            Err(e) => {
                warn!(sync_id = %op.sync_id, error = %e, "lock acquisition failed, skipping PVC");
                return Ok(WorkflowOutcome::Skipped);
            }
        }

        // State 1: deploy rsync pod, retried per the mapping's policy.
        let retry_cfg = mapping.retry_config();
        let ready_timeout = self.rsync_pod_ready_timeout;
        let handle = with_retry_config(&retry_cfg, cancel, || {
            self.rsync_pod_manager.ensure(&op.dest_namespace, &op.dest_pvc, &key_source, ready_timeout)
        })
        .await?;
        self.status
            .emit_event(&op.source_namespace, &op.source_pvc, "", EventReason::RsyncPodDeployed)
            .await;
        op.rsync_pod_handle = Some(handle.clone());

        // States 2+3: generate and install an SSH keypair, unless cached.
        let key_pair = if key_source.has_cached_keys() {
            None
        } else {
            let pair = generate_keypair(&op.dest_namespace)?;
            podexec::exec(
                &self.dest_client,
                &handle.namespace,
                &handle.pod_name,
                install_private_key_command(&pair.private_key),
                Duration::from_secs(15),
            )
            .await?;
            Some(pair)
        };

        // State 4: confirm the source PVC is mounted somewhere.
        if !self.locator.has_volume_attachments(&op.source_namespace, &op.source_pvc).await? {
            info!(sync_id = %op.sync_id, "source PVC has no volume attachments, skipping");
            return Ok(WorkflowOutcome::Skipped);
        }

        // State 5: find the node.
        let node = self
            .locator
            .find_pvc_node(&op.source_namespace, &op.source_pvc)
            .await?
            .ok_or_else(|| SyncError::fatal(anyhow::anyhow!("no node found for source PVC after attachment check")))?;

        // State 6: find the agent pod + IP.
        let agent = self.locator.find_agent_pod(&node).await?;

        // State 7: find the mount path, short-circuiting via cache.
        let mount_path = self.resolve_mount_path(op, &node, &agent).await?;

        // State 8: push the public key to the agent, unless cached.
        if let Some(pair) = &key_pair {
            self.push_public_key(&agent, pair).await?;
        }
        self.status.emit_event(&op.source_namespace, &op.source_pvc, "", EventReason::SSHConnected).await;

        // State 9: SSH connectivity test.
        let ssh_port = remote_cluster.pvc_sync.ssh.port;
        let test_out = podexec::exec(
            &self.dest_client,
            &handle.namespace,
            &handle.pod_name,
            sshkeys::ssh_connectivity_test_command(&agent.ip, ssh_port),
            SSH_CONNECTIVITY_TIMEOUT,
        )
        .await?;
        if !test_out.stdout.contains(sshkeys::SSH_CONNECTIVITY_MARKER) {
            return Err(SyncError::fatal(anyhow::anyhow!(
                "SSH connectivity test did not report success: {:?}",
                test_out.stdout
            )));
        }

        // State 10: run rsync, retried and verified.
        let private_key_path = "/root/.ssh/id_rsa".to_string();
        let verification_policy = {
            let pvc_override = self.read_pvc_verification_override(&op.source_namespace, &op.source_pvc).await?;
            let mapping_defaults = MappingVerificationDefaults {
                mode: mapping.data_sync_config.verification_mode,
                sample_percent: mapping.data_sync_config.sample_percent,
            };
            let cluster_defaults = ClusterVerificationDefaults {
                mode: remote_cluster.pvc_sync.default_verification_mode,
                sample_percent: remote_cluster.pvc_sync.default_sample_percent,
            };
            resolve_policy(pvc_override, mapping_defaults, cluster_defaults)
        };

        let req = RsyncRequest {
            dest_namespace: handle.namespace.clone(),
            dest_pod_name: handle.pod_name.clone(),
            source_node_ip: agent.ip.clone(),
            source_ssh_port: ssh_port,
            private_key_path,
            source_mount_path: mount_path,
            rsync_options: mapping.data_sync_config.rsync_options.clone(),
            bandwidth_limit_kbps: mapping.data_sync_config.bandwidth_limit_kbps,
            verification_policy,
        };
        let report = self.rsync_executor.run(&req, &retry_cfg, cancel).await?;

        // State 11: update source PVC annotations. A write failure here
        // is treated as fatal to the attempt (see DESIGN.md).
        let status = SyncStatus {
            phase: SyncPhase::Completed,
            start_time: op.start_time,
            completion_time: Some(Utc::now()),
            bytes_transferred: report.stats.bytes_transferred,
            files_transferred: report.stats.files_transferred,
            progress: report.stats.progress,
            error: None,
            verification: Some(report.verification),
        };
        self.write_status(op, status).await?;
        self.status
            .write_completion(&op.source_namespace, &op.source_pvc, &op.dest_namespace, &op.dest_pvc, "Completed")
            .await?;

        Ok(WorkflowOutcome::Completed)
    }

    async fn resolve_mount_path(
        &self,
        op: &SyncOperation,
        node: &str,
        agent: &crate::locator::AgentPod,
    ) -> SyncResult<String> {
        if let Some(cache) = self.locator.read_mount_path_cache(&op.source_namespace, &op.source_pvc).await? {
            if cache.node_name == node
                && cache.agent_pod_uid == agent.uid
                && cache.is_fresh(Utc::now(), self.mount_path_cache_ttl)
            {
                return Ok(cache.path);
            }
        }

        let pv_name = self
            .locator
            .bound_pv_name(&op.source_namespace, &op.source_pvc)
            .await?
            .unwrap_or_default();
        let path = self
            .locator
            .find_mount_path(&op.source_namespace, &op.source_pvc, &pv_name, &agent.namespace, &agent.pod_name)
            .await?;

        let cache = MountPathCache {
            path: path.clone(),
            node_name: node.to_string(),
            agent_pod_uid: agent.uid.clone(),
            timestamp: Utc::now(),
        };
        self.locator.write_mount_path_cache(&op.source_namespace, &op.source_pvc, &cache).await?;
        Ok(path)
    }

    async fn push_public_key(&self, agent: &crate::locator::AgentPod, pair: &KeyPair) -> SyncResult<()> {
        let existing = podexec::exec(
            &self.source_client,
            &agent.namespace,
            &agent.pod_name,
            sshkeys::read_authorized_keys_command(),
            Duration::from_secs(15),
        )
        .await?;
        let updated = append_authorized_key(&existing.stdout, &pair.public_key);
        podexec::exec(
            &self.source_client,
            &agent.namespace,
            &agent.pod_name,
            sshkeys::write_authorized_keys_command(&updated),
            Duration::from_secs(15),
        )
        .await?;
        Ok(())
    }

    async fn read_pvc_verification_override(
        &self,
        namespace: &str,
        pvc_name: &str,
    ) -> SyncResult<PvcVerificationOverride> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.source_client.clone(), namespace);
        let pvc = api
            .get(pvc_name)
            .await
            .map_err(|e| SyncError::fatal(anyhow::anyhow!("failed to read PVC for verification override: {e}")))?;
        Ok(PvcVerificationOverride::from_annotations(pvc.metadata.annotations.as_ref()))
    }

    async fn write_status(&self, op: &SyncOperation, status: SyncStatus) -> SyncResult<()> {
        self.status.write_status(&op.source_namespace, &op.source_pvc, &status).await
    }

    /// States 12 and 13 plus final event/metric emission. Runs
    /// regardless of whether `result` is success, skip, or failure, and
    /// its own failures are logged, never propagated (§7
    /// CleanupWarning).
    async fn finalize(
        &self,
        op: &mut SyncOperation,
        result: SyncResult<WorkflowOutcome>,
    ) -> SyncResult<()> {
        let elapsed = (Utc::now() - op.start_time).to_std().unwrap_or(Duration::ZERO);

        // State 12: clean the rsync pod, best-effort.
        if let Some(handle) = &op.rsync_pod_handle {
            if let Err(e) = self.rsync_pod_manager.cleanup(handle).await {
                warn!(sync_id = %op.sync_id, error = %e, "rsync pod cleanup failed");
            }
        }

        // State 13: release the lock, best-effort. Runs even when the
        // workflow was cancelled: the release itself is a plain kube
        // call, not bound to any cancellation token, and a cancelled run
        // must not leave the source PVC locked until the TTL expires.
        if op.lock_acquired {
            if let Err(e) = self.lock.release(&op.source_namespace, &op.source_pvc, &self.pod_identity).await {
                warn!(sync_id = %op.sync_id, error = %e, "lock release failed");
            } else {
                self.status.emit_event(&op.source_namespace, &op.source_pvc, "", EventReason::LockReleased).await;
            }
        }

        match result {
            Ok(WorkflowOutcome::Completed) => {
                self.status.emit_event(&op.source_namespace, &op.source_pvc, "", EventReason::SyncCompleted).await;
                self.status.record_operation_metric(&op.source_namespace, &op.source_pvc, &op.dest_namespace, "success");
                Ok(())
            }
            Ok(WorkflowOutcome::Skipped) => {
                self.status.emit_event(&op.source_namespace, &op.source_pvc, "", EventReason::SyncSkipped).await;
                self.status.record_operation_metric(&op.source_namespace, &op.source_pvc, &op.dest_namespace, "skipped");
                Ok(())
            }
            Err(e) => {
                error!(sync_id = %op.sync_id, elapsed = ?elapsed, error = %e, "workflow failed");
                let status = SyncStatus {
                    phase: SyncPhase::Failed,
                    start_time: op.start_time,
                    completion_time: Some(Utc::now()),
                    bytes_transferred: 0,
                    files_transferred: 0,
                    progress: 0,
                    error: Some(e.to_string()),
                    verification: None,
                };
                let _ = self.write_status(op, status).await;
                self.status.emit_event(&op.source_namespace, &op.source_pvc, "", EventReason::SyncFailed).await;
                self.status.record_operation_metric(&op.source_namespace, &op.source_pvc, &op.dest_namespace, "failure");
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkflowOutcome {
    Completed,
    Skipped,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
