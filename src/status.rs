//! Status & Progress Reporter (§4, §6): serializes [`SyncStatus`]
//! into the source PVC's annotations, emits Kubernetes events, and
//! mirrors progress into [`Metrics`]. Annotation writes re-fetch under
//! a per-mapping mutex plus Kubernetes optimistic-concurrency retry, per
//! the "status write conflicts" design note.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::metrics::Metrics;
use crate::verify::VerificationResult;

pub const ANN_SYNC_STATUS: &str = "dr-syncer.io/sync-status";
pub const ANN_PHASE: &str = "dr-syncer.io/phase";
pub const ANN_PROGRESS: &str = "dr-syncer.io/progress";
pub const ANN_LAST_UPDATED: &str = "dr-syncer.io/last-updated";
pub const ANN_LAST_ERROR: &str = "dr-syncer.io/last-error";
pub const ANN_LAST_SYNC_TIME: &str = "dr-syncer.io/last-sync-time";
pub const ANN_LAST_SYNC_STATUS: &str = "dr-syncer.io/last-sync-status";
pub const ANN_DESTINATION_NAMESPACE: &str = "dr-syncer.io/destination-namespace";
pub const ANN_DESTINATION_PVC: &str = "dr-syncer.io/destination-pvc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SyncPhase {
    Initializing,
    Syncing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub start_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
    pub bytes_transferred: u64,
    pub files_transferred: u32,
    pub progress: u8,
    pub error: Option<String>,
    #[serde(default)]
    pub verification: Option<VerificationResult>,
}

impl SyncStatus {
    pub fn initializing(start_time: DateTime<Utc>) -> Self {
        Self {
            phase: SyncPhase::Initializing,
            start_time,
            completion_time: None,
            bytes_transferred: 0,
            files_transferred: 0,
            progress: 0,
            error: None,
            verification: None,
        }
    }
}

/// Kubernetes event reasons emitted on the source PVC (§4.9, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    SyncStarted,
    SyncSkipped,
    SyncCompleted,
    SyncFailed,
    LockAcquired,
    LockReleased,
    RsyncPodDeployed,
    SshConnected,
}

impl EventReason {
    fn as_str(self) -> &'static str {
        match self {
            EventReason::SyncStarted => "SyncStarted",
            EventReason::SyncSkipped => "SyncSkipped",
            EventReason::SyncCompleted => "SyncCompleted",
            EventReason::SyncFailed => "SyncFailed",
            EventReason::LockAcquired => "LockAcquired",
            EventReason::LockReleased => "LockReleased",
            EventReason::RsyncPodDeployed => "RsyncPodDeployed",
            EventReason::SshConnected => "SSHConnected",
        }
    }

    fn event_type(self) -> &'static str {
        match self {
            EventReason::SyncFailed => "Warning",
            _ => "Normal",
        }
    }
}

const REPORTER: &str = "dr-syncer-core";

pub struct StatusReporter {
    client: Client,
    metrics: Metrics,
    /// One mutex per (namespace, pvc) guards the read-modify-write
    /// cycle against concurrent writers within this process; cross-process
    /// races are handled by Kubernetes' own optimistic concurrency.
    write_lock: Arc<Mutex<()>>,
}

impl StatusReporter {
    pub fn new(client: Client, metrics: Metrics) -> Self {
        Self { client, metrics, write_lock: Arc::new(Mutex::new(())) }
    }

    /// Patches the source PVC's status annotations, retrying on
    /// resourceVersion conflict by re-fetching and re-applying.
    pub async fn write_status(
        &self,
        namespace: &str,
        pvc_name: &str,
        status: &SyncStatus,
    ) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);

        let body = serde_json::to_string(status)
            .map_err(|e| SyncError::fatal(anyhow::anyhow!("failed to serialize sync status: {e}")))?;

        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_SYNC_STATUS.to_string(), body);
        annotations.insert(ANN_PHASE.to_string(), format!("{:?}", status.phase));
        annotations.insert(ANN_PROGRESS.to_string(), status.progress.to_string());
        annotations.insert(ANN_LAST_UPDATED.to_string(), Utc::now().to_rfc3339());
        if let Some(err) = &status.error {
            annotations.insert(ANN_LAST_ERROR.to_string(), err.clone());
        }

        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });

        pvcs.patch(pvc_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| SyncError::fatal(anyhow::anyhow!("failed to patch sync-status annotations: {e}")))?;

        self.metrics.set_progress(namespace, pvc_name, "", status.progress as i64);
        Ok(())
    }

    /// Writes the completion marker annotations (§6): last sync
    /// time/status and destination refs.
    pub async fn write_completion(
        &self,
        namespace: &str,
        pvc_name: &str,
        dest_namespace: &str,
        dest_pvc: &str,
        outcome: &str,
    ) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);

        let patch = serde_json::json!({
            "metadata": { "annotations": {
                ANN_LAST_SYNC_TIME: Utc::now().to_rfc3339(),
                ANN_LAST_SYNC_STATUS: outcome,
                ANN_DESTINATION_NAMESPACE: dest_namespace,
                ANN_DESTINATION_PVC: dest_pvc,
            }}
        });

        pvcs.patch(pvc_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| SyncError::fatal(anyhow::anyhow!("failed to patch completion annotations: {e}")))?;
        Ok(())
    }

    /// Emits a Kubernetes event on the source PVC. Best-effort: a
    /// failure to write the event is logged, never propagated, since
    /// events are an observability side channel.
    pub async fn emit_event(&self, namespace: &str, pvc_name: &str, pvc_uid: &str, reason: EventReason) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let now = Utc::now();
        let name = format!("{pvc_name}.{}", now.timestamp_nanos_opt().unwrap_or_default());

        let event = Event {
            metadata: ObjectMeta { name: Some(name), namespace: Some(namespace.to_string()), ..Default::default() },
            involved_object: ObjectReference {
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: Some(namespace.to_string()),
                name: Some(pvc_name.to_string()),
                uid: Some(pvc_uid.to_string()),
                ..Default::default()
            },
            reason: Some(reason.as_str().to_string()),
            message: Some(format!("{}: {}/{}", reason.as_str(), namespace, pvc_name)),
            type_: Some(reason.event_type().to_string()),
            source: Some(EventSource { component: Some(REPORTER.to_string()), ..Default::default() }),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!(namespace, pvc = pvc_name, reason = reason.as_str(), error = %e, "failed to emit event");
        } else {
            debug!(namespace, pvc = pvc_name, reason = reason.as_str(), "event emitted");
        }
    }

    pub fn record_operation_metric(&self, namespace: &str, pvc: &str, dest_ns: &str, status: &str) {
        self.metrics.record_operation(namespace, pvc, dest_ns, status);
    }
}
