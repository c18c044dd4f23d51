//! Source-side locator (§4.5): resolves the on-disk mount path of a
//! source PVC by finding a pod or `VolumeAttachment` that references it,
//! the node that attachment lives on, the agent pod running there, and
//! finally the kubelet mount path via `df`/`mount`/`find`.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::podexec;

const MOUNT_PATH_CACHE_ANNOTATION: &str = "dr-syncer.io/mount-path-cache";
const DF_MOUNT_TIMEOUT: Duration = Duration::from_secs(15);
const FIND_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountPathCache {
    pub path: String,
    pub node_name: String,
    pub agent_pod_uid: String,
    pub timestamp: DateTime<Utc>,
}

impl MountPathCache {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        now.signed_duration_since(self.timestamp) <= ttl
    }
}

#[derive(Debug, Clone)]
pub struct AgentPod {
    pub namespace: String,
    pub pod_name: String,
    pub uid: String,
    pub ip: String,
}

pub struct SourceLocator {
    client: Client,
    agent_label_selector: String,
}

impl SourceLocator {
    pub fn new(client: Client, agent_label_selector: impl Into<String>) -> Self {
        Self {
            client,
            agent_label_selector: agent_label_selector.into(),
        }
    }

    /// Step 1: does anything reference this PVC right now — a running
    /// pod, or a `VolumeAttachment` against its bound PV?
    pub async fn has_volume_attachments(&self, namespace: &str, pvc_name: &str) -> SyncResult<bool> {
        Ok(self.find_pvc_node(namespace, pvc_name).await?.is_some())
    }

    /// Steps 1+2 combined: the node a source PVC is currently mounted
    /// on, via a referencing pod first, then a matching
    /// `VolumeAttachment`.
    pub async fn find_pvc_node(&self, namespace: &str, pvc_name: &str) -> SyncResult<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_list = pods
            .list(&ListParams::default())
            .await
            .context("failed to list pods while locating source PVC")
            .map_err(SyncError::fatal)?;

        if let Some(node) = pod_list
            .items
            .iter()
            .find(|p| pod_uses_pvc(p, pvc_name) && pod_is_running(p))
            .and_then(|p| p.spec.as_ref()?.node_name.clone())
        {
            return Ok(Some(node));
        }

        let Some(pv_name) = self.bound_pv_name(namespace, pvc_name).await? else {
            return Ok(None);
        };

        let attachments: Api<VolumeAttachment> = Api::all(self.client.clone());
        let list = attachments
            .list(&ListParams::default())
            .await
            .context("failed to list VolumeAttachments")
            .map_err(SyncError::fatal)?;

        Ok(list
            .items
            .into_iter()
            .find(|va| {
                va.spec.source.persistent_volume_name.as_deref() == Some(pv_name.as_str())
                    && va.status.as_ref().is_some_and(|s| s.attached)
            })
            .map(|va| va.spec.node_name))
    }

    /// The PV name a source PVC is bound to, needed by callers driving
    /// step 7's `df`/`mount` filters.
    pub async fn bound_pv_name(&self, namespace: &str, pvc_name: &str) -> SyncResult<Option<String>> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = pvcs
            .get(pvc_name)
            .await
            .context("failed to read PVC to resolve bound PV")
            .map_err(SyncError::fatal)?;
        Ok(pvc.spec.and_then(|s| s.volume_name))
    }

    /// Step 3: the Running agent pod scheduled on `node`, and its
    /// reachable IP (external preferred, internal fallback).
    pub async fn find_agent_pod(&self, node: &str) -> SyncResult<AgentPod> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&self.agent_label_selector);
        let list = pods
            .list(&lp)
            .await
            .context("failed to list agent pods")
            .map_err(SyncError::fatal)?;

        let agent = list
            .items
            .into_iter()
            .find(|p| {
                pod_is_running(p) && p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node)
            })
            .ok_or_else(|| SyncError::fatal(anyhow::anyhow!("no running agent pod on node {node}")))?;

        let namespace = agent.namespace().unwrap_or_default();
        let pod_name = agent.name_any();
        let uid = agent.uid().unwrap_or_default();

        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_obj = nodes
            .get(node)
            .await
            .context("failed to read node for agent IP resolution")
            .map_err(SyncError::fatal)?;
        let ip = node_ip(&node_obj)
            .ok_or_else(|| SyncError::fatal(anyhow::anyhow!("node {node} has no usable address")))?;

        Ok(AgentPod { namespace, pod_name, uid, ip })
    }

    /// Step 4: resolve the on-disk kubelet mount path via, in order,
    /// `df`, `mount`, then a time-bounded `find`. Returns the first
    /// non-empty result.
    pub async fn find_mount_path(
        &self,
        namespace: &str,
        pvc_name: &str,
        pv_name: &str,
        agent_namespace: &str,
        agent_pod: &str,
    ) -> SyncResult<String> {
        let df_cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("df | grep -E '{pv_name}|{pvc_name}'"),
        ];
        if let Ok(out) = podexec::exec(&self.client, agent_namespace, agent_pod, df_cmd, DF_MOUNT_TIMEOUT).await {
            if let Some(path) = parse_df_output(&out.stdout) {
                debug!(namespace, pvc_name, path, "resolved mount path via df");
                return Ok(path);
            }
        }

        let mount_cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("mount | grep '{pv_name}'"),
        ];
        if let Ok(out) = podexec::exec(&self.client, agent_namespace, agent_pod, mount_cmd, DF_MOUNT_TIMEOUT).await
        {
            if let Some(path) = parse_mount_output(&out.stdout) {
                debug!(namespace, pvc_name, path, "resolved mount path via mount");
                return Ok(path);
            }
        }

        let find_cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "find /var/lib/kubelet/pods -maxdepth 6 -type d -path '*{pvc_name}*' 2>/dev/null"
            ),
        ];
        let out = podexec::exec(&self.client, agent_namespace, agent_pod, find_cmd, FIND_TIMEOUT)
            .await
            .context("find fallback for mount path lookup failed")
            .map_err(SyncError::fatal)?;
        if let Some(path) = parse_find_output(&out.stdout) {
            info!(namespace, pvc_name, path, "resolved mount path via find fallback");
            return Ok(path);
        }

        Err(SyncError::fatal(anyhow::anyhow!(
            "could not resolve mount path for {namespace}/{pvc_name}: df, mount, and find all failed"
        )))
    }

    /// Reads the mount-path cache annotation, if present and parseable.
    pub async fn read_mount_path_cache(
        &self,
        namespace: &str,
        pvc_name: &str,
    ) -> SyncResult<Option<MountPathCache>> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = pvcs
            .get(pvc_name)
            .await
            .context("failed to read PVC for mount-path cache")
            .map_err(SyncError::fatal)?;

        Ok(pvc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(MOUNT_PATH_CACHE_ANNOTATION))
            .and_then(|raw| serde_json::from_str(raw).ok()))
    }

    /// Writes the mount-path cache annotation.
    pub async fn write_mount_path_cache(
        &self,
        namespace: &str,
        pvc_name: &str,
        cache: &MountPathCache,
    ) -> SyncResult<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let raw = serde_json::to_string(cache)
            .context("failed to serialize mount-path cache")
            .map_err(SyncError::fatal)?;
        let patch = json!({
            "metadata": {
                "annotations": {
                    MOUNT_PATH_CACHE_ANNOTATION: raw,
                }
            }
        });
        pvcs.patch(pvc_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("failed to write mount-path cache annotation")
            .map_err(SyncError::fatal)?;
        Ok(())
    }
}

fn pod_uses_pvc(pod: &Pod, pvc_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .any(|claim| claim.claim_name == pvc_name)
        })
        .unwrap_or(false)
}

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

fn node_ip(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    addresses
        .iter()
        .find(|a| a.type_ == "ExternalIP")
        .or_else(|| addresses.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone())
}

/// Extracts the mount point (last whitespace-separated field) from the
/// first matching `df` line.
fn parse_df_output(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .and_then(|line| line.split_whitespace().last())
        .map(str::to_string)
}

/// Parses `<device> on <path> type <fstype> (<opts>)` from the first
/// matching `mount` line.
fn parse_mount_output(stdout: &str) -> Option<String> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let after_on = line.split(" on ").nth(1)?;
    let path = after_on.split(" type ").next()?;
    Some(path.trim().to_string())
}

/// Takes the first non-empty line from a `find` invocation.
fn parse_find_output(stdout: &str) -> Option<String> {
    stdout.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string)
}
