//! Shared pod-exec helper (§4.4–§4.8): every component that needs
//! to run a command inside a pod — rsync-pod key generation, the
//! source-side locator's `df`/`mount`/`find`, the rsync invocation
//! itself, and sample verification's `md5sum` — goes through this one
//! wrapper around `kube::Api::exec`.

use std::time::Duration;

use anyhow::Context;
use futures::{AsyncReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `command` inside `pod_name` (container defaults to the pod's
/// only/first container) via `kubectl exec`-equivalent attach, bounded
/// by `timeout`. Collects stdout/stderr fully; callers needing to
/// stream instead should use `kube`'s `Api::exec` directly.
pub async fn exec(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    command: Vec<String>,
    timeout: Duration,
) -> SyncResult<ExecOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let ap = AttachParams::default().stdout(true).stderr(true);

    let attached = tokio::time::timeout(timeout, pods.exec(pod_name, command, &ap))
        .await
        .map_err(|_| SyncError::Transient(format!("exec channel timed out after {timeout:?}")))?
        .context("failed to start pod exec")
        .map_err(SyncError::fatal)?;

    collect(attached, timeout).await
}

async fn collect(
    mut attached: kube::api::AttachedProcess,
    timeout: Duration,
) -> SyncResult<ExecOutput> {
    let mut stdout_stream = attached.stdout().context("exec had no stdout stream").map_err(SyncError::fatal)?;
    let mut stderr_stream = attached.stderr().context("exec had no stderr stream").map_err(SyncError::fatal)?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    let read = async {
        let _ = stdout_stream.read_to_string(&mut stdout).await;
        let _ = stderr_stream.read_to_string(&mut stderr).await;
    };

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| SyncError::Transient(format!("exec output read timed out after {timeout:?}")))?;

    // Best-effort: wait for the process to finish so kube's internal
    // channels are drained; ignore the status itself since callers
    // inspect stdout/stderr/exit conventions per their own command.
    if let Some(status) = attached.take_status() {
        let _ = status.collect::<Vec<_>>().await;
    }

    Ok(ExecOutput { stdout, stderr })
}
