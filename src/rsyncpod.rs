//! Rsync-pod manager (§4.4): ensures exactly one rsync pod exists
//! for a (destination namespace, destination PVC) pair, mounting the
//! destination PVC at `/data` and idling until remote-exec'd.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::sshkeys::KeySource;

const PVC_LABEL: &str = "dr-syncer.io/pvc";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "dr-syncer-core";

#[derive(Debug, Clone)]
pub struct RsyncPodHandle {
    pub name: String,
    pub namespace: String,
    pub pod_name: String,
    pub pvc_name: String,
    pub has_cached_keys: bool,
}

pub struct RsyncPodManager {
    client: Client,
}

impl RsyncPodManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployment_name(pvc_name: &str) -> String {
        format!("dr-syncer-rsync-{pvc_name}")
    }

    /// Ensures a single rsync pod is available for `pvc_name` in
    /// `namespace`, cleaning up any leftover deployment from a prior
    /// run first, then waits for it to become ready.
    pub async fn ensure(
        &self,
        namespace: &str,
        pvc_name: &str,
        key_source: &KeySource,
        ready_timeout: Duration,
    ) -> SyncResult<RsyncPodHandle> {
        self.cleanup_existing(namespace, pvc_name).await?;

        let name = Self::deployment_name(pvc_name);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = self.build_deployment(&name, pvc_name, key_source);

        deployments
            .create(&PostParams::default(), &deployment)
            .await
            .context("failed to create rsync pod deployment")
            .map_err(SyncError::fatal)?;

        info!(namespace, pvc = pvc_name, deployment = %name, "rsync pod deployment created");

        let pod_name = self.wait_ready(namespace, pvc_name, ready_timeout).await?;

        Ok(RsyncPodHandle {
            name,
            namespace: namespace.to_string(),
            pod_name,
            pvc_name: pvc_name.to_string(),
            has_cached_keys: key_source.has_cached_keys(),
        })
    }

    fn build_deployment(&self, name: &str, pvc_name: &str, key_source: &KeySource) -> Deployment {
        let mut labels = BTreeMap::new();
        labels.insert(PVC_LABEL.to_string(), pvc_name.to_string());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let mut volumes = vec![Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name.to_string(),
                read_only: Some(false),
            }),
            ..Default::default()
        }];
        let mut volume_mounts = vec![VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        }];

        if let KeySource::Cached { secret_name } = key_source {
            volumes.push(Volume {
                name: "ssh-keys".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret_name.clone()),
                    default_mode: Some(0o600),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: "ssh-keys".to_string(),
                mount_path: "/root/.ssh".to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let container = Container {
            name: "rsync".to_string(),
            image: Some("dr-syncer/rsync-agent:latest".to_string()),
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Deletes any rsync-pod deployment left over from a previous run
    /// for this PVC, since orphans accumulate otherwise (§4.4).
    pub async fn cleanup_existing(&self, namespace: &str, pvc_name: &str) -> SyncResult<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = Self::deployment_name(pvc_name);

        match deployments.get(&name).await {
            Ok(_) => {
                debug!(namespace, pvc = pvc_name, "removing leftover rsync pod deployment");
                self.delete_deployment(namespace, &name).await
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(SyncError::fatal(anyhow::anyhow!(e))),
        }
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> SyncResult<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match deployments.delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(SyncError::fatal(anyhow::anyhow!(e))),
        }
    }

    /// Cleans up the rsync pod for `handle` (§4.9 state 12,
    /// best-effort).
    pub async fn cleanup(&self, handle: &RsyncPodHandle) -> SyncResult<()> {
        self.delete_deployment(&handle.namespace, &handle.name)
            .await
            .map_err(|e| SyncError::cleanup(anyhow::anyhow!(e)))
    }

    async fn wait_ready(
        &self,
        namespace: &str,
        pvc_name: &str,
        timeout: Duration,
    ) -> SyncResult<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{PVC_LABEL}={pvc_name}"));
        let deadline = std::time::Instant::now() + timeout;

        loop {
            let list = pods
                .list(&lp)
                .await
                .context("failed to list rsync pods while waiting for readiness")
                .map_err(SyncError::fatal)?;

            if let Some(pod) = list.items.iter().find(|p| pod_is_running_and_ready(p)) {
                return Ok(pod.name_any());
            }

            if std::time::Instant::now() >= deadline {
                return Err(SyncError::fatal(anyhow::anyhow!(
                    "rsync pod for {namespace}/{pvc_name} did not become ready within {timeout:?}"
                )));
            }

            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

fn pod_is_running_and_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod(phase: &str, ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn running_and_ready_pod_passes() {
        assert!(pod_is_running_and_ready(&pod("Running", true)));
    }

    #[test]
    fn running_but_not_ready_pod_is_rejected() {
        assert!(!pod_is_running_and_ready(&pod("Running", false)));
    }

    #[test]
    fn pending_pod_is_rejected_regardless_of_conditions() {
        assert!(!pod_is_running_and_ready(&pod("Pending", true)));
    }

    #[test]
    fn deployment_name_is_stable_and_namespaced_by_pvc() {
        assert_eq!(RsyncPodManager::deployment_name("data-pvc"), "dr-syncer-rsync-data-pvc");
    }
}
