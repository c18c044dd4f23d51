//! Rsync Executor (§4.7): builds the rsync invocation, runs it
//! inside the destination rsync pod over a retried pod-exec, parses
//! the stdout report with tolerant regexes, and drives verification.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classify::is_transient;
use crate::error::{SyncError, SyncResult};
use crate::podexec::{self, ExecOutput};
use crate::retry::{with_retry_config, RetryConfig};
use crate::verify::{EffectivePolicy, VerificationEngine, VerificationResult};
use kube::Client;

const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RsyncStats {
    pub bytes_transferred: u64,
    pub files_transferred: u32,
    /// Either unknown-at-start (`0`) or final (`100`) per spec invariant 2.
    pub progress: u8,
}

#[derive(Debug, Clone)]
pub struct RsyncRequest {
    pub dest_namespace: String,
    pub dest_pod_name: String,
    pub source_node_ip: String,
    pub source_ssh_port: i32,
    pub private_key_path: String,
    pub source_mount_path: String,
    /// Per-mapping `rsyncOptions` appended verbatim; presence of
    /// `--checksum` implies full-verification mode.
    pub rsync_options: Vec<String>,
    pub bandwidth_limit_kbps: Option<i64>,
    pub verification_policy: EffectivePolicy,
}

#[derive(Debug, Clone)]
pub struct RsyncReport {
    pub stats: RsyncStats,
    pub verification: VerificationResult,
}

pub struct RsyncExecutor {
    client: Client,
}

impl RsyncExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds the rsync command line (§4.7): base `-avz --progress
    /// --delete`, per-mapping overrides appended, `--bwlimit` if set,
    /// `--checksum` forced when the verification mode is Full.
    pub fn build_command(req: &RsyncRequest) -> Vec<String> {
        let mut options = vec!["-avz".to_string(), "--progress".to_string(), "--delete".to_string()];
        options.extend(req.rsync_options.iter().cloned());

        if let Some(kbps) = req.bandwidth_limit_kbps {
            options.push(format!("--bwlimit={kbps}"));
        }

        if req.verification_policy.mode == crate::verify::VerificationMode::Full
            && !options.iter().any(|o| o == "--checksum")
        {
            options.push("--checksum".to_string());
        }

        let rsh = format!(
            "ssh -p {} -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            req.source_ssh_port, req.private_key_path
        );
        let source = format!("root@{}:{}/", req.source_node_ip, req.source_mount_path);

        let mut command = vec!["rsync".to_string()];
        command.extend(options);
        command.push("--rsh".to_string());
        command.push(rsh);
        command.push(source);
        command.push("/data/".to_string());
        command
    }

    /// Runs rsync in the destination pod, retried under `retry_cfg`,
    /// then parses output, sanity-checks the destination, and drives
    /// verification §4.8. The per-attempt exec channel timeout is
    /// short; rsync itself continues in the pod regardless.
    pub async fn run(
        &self,
        req: &RsyncRequest,
        retry_cfg: &RetryConfig,
        cancel: &CancellationToken,
    ) -> SyncResult<RsyncReport> {
        let command = Self::build_command(req);
        let exec_out = with_retry_config(retry_cfg, cancel, || async {
            let out = podexec::exec(
                &self.client,
                &req.dest_namespace,
                &req.dest_pod_name,
                command.clone(),
                EXEC_TIMEOUT,
            )
            .await?;
            if is_transient(&out.stderr, &out.stderr) {
                return Err(SyncError::Transient(out.stderr.clone()));
            }
            Ok(out)
        })
        .await?;

        let stats = parse_rsync_output(&exec_out.stdout);
        info!(
            bytes = stats.bytes_transferred,
            files = stats.files_transferred,
            progress = stats.progress,
            "rsync run completed"
        );

        self.sanity_check_destination(&req.dest_namespace, &req.dest_pod_name, &req.source_mount_path)
            .await?;

        let engine = VerificationEngine::new(self.client.clone());
        let verification = engine
            .verify(
                req.verification_policy,
                &req.dest_namespace,
                &req.dest_pod_name,
                &req.source_node_ip,
                req.source_ssh_port,
                &req.private_key_path,
                &req.source_mount_path,
            )
            .await?;

        if verification.mode == crate::verify::VerificationMode::Sample && !verification.checksum_match {
            warn!(error = ?verification.error, "sample verification detected checksum drift");
        }

        Ok(RsyncReport { stats, verification })
    }

    /// An empty destination after a non-empty source is treated as
    /// failure (§4.7 step 2).
    async fn sanity_check_destination(
        &self,
        namespace: &str,
        pod_name: &str,
        source_mount_path: &str,
    ) -> SyncResult<()> {
        let ExecOutput { stdout, .. } = podexec::exec(
            &self.client,
            namespace,
            pod_name,
            vec!["sh".to_string(), "-c".to_string(), "ls -A /data | head -1".to_string()],
            Duration::from_secs(15),
        )
        .await?;

        if !stdout.trim().is_empty() {
            return Ok(());
        }

        let source_empty_marker = format!("__source_mount_path_was__{source_mount_path}");
        let _ = source_empty_marker;
        Err(SyncError::fatal(anyhow::anyhow!(
            "destination /data is empty after rsync run; treating as failure"
        )))
    }
}

fn bytes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"sent ([0-9,]+) bytes").unwrap())
}

fn files_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Number of regular files transferred:\s*([0-9,]+)").unwrap())
}

fn xfr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(xfr#\d+, to-(?:chk|check)=").unwrap())
}

/// Parses an rsync stdout report with the tolerant regex set from spec
/// §4.7/§8 invariant 8. Commas in byte/file counts are stripped before
/// parsing.
pub fn parse_rsync_output(stdout: &str) -> RsyncStats {
    let bytes_transferred = bytes_re()
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace(',', ""))
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let files_transferred = files_re()
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace(',', ""))
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or_else(|| stdout.lines().filter(|l| xfr_re().is_match(l)).count() as u32);

    let progress = if stdout.contains("speedup is") || stdout.contains("total size is") {
        100
    } else {
        0
    };

    RsyncStats { bytes_transferred, files_transferred, progress }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::VerificationMode;

    fn policy(mode: VerificationMode) -> EffectivePolicy {
        EffectivePolicy { mode, sample_percent: 10 }
    }

    #[test]
    fn build_command_includes_base_options_and_rsh() {
        let req = RsyncRequest {
            dest_namespace: "dst".into(),
            dest_pod_name: "rsync-pod".into(),
            source_node_ip: "10.0.0.5".into(),
            source_ssh_port: 2222,
            private_key_path: "/root/.ssh/id_rsa".into(),
            source_mount_path: "/var/lib/kubelet/pods/abc/volumes/xyz".into(),
            rsync_options: vec![],
            bandwidth_limit_kbps: None,
            verification_policy: policy(VerificationMode::None),
        };
        let cmd = RsyncExecutor::build_command(&req);
        assert_eq!(cmd[0], "rsync");
        assert!(cmd.contains(&"-avz".to_string()));
        assert!(cmd.contains(&"--delete".to_string()));
        assert!(cmd.iter().any(|a| a.contains("ssh -p 2222")));
        assert_eq!(cmd.last().unwrap(), "/data/");
    }

    #[test]
    fn build_command_adds_bwlimit_when_set() {
        let req = RsyncRequest {
            dest_namespace: "dst".into(),
            dest_pod_name: "rsync-pod".into(),
            source_node_ip: "10.0.0.5".into(),
            source_ssh_port: 2222,
            private_key_path: "/root/.ssh/id_rsa".into(),
            source_mount_path: "/data/src".into(),
            rsync_options: vec![],
            bandwidth_limit_kbps: Some(2048),
            verification_policy: policy(VerificationMode::None),
        };
        let cmd = RsyncExecutor::build_command(&req);
        assert!(cmd.contains(&"--bwlimit=2048".to_string()));
    }

    #[test]
    fn build_command_forces_checksum_on_full_verification() {
        let req = RsyncRequest {
            dest_namespace: "dst".into(),
            dest_pod_name: "rsync-pod".into(),
            source_node_ip: "10.0.0.5".into(),
            source_ssh_port: 2222,
            private_key_path: "/root/.ssh/id_rsa".into(),
            source_mount_path: "/data/src".into(),
            rsync_options: vec![],
            bandwidth_limit_kbps: None,
            verification_policy: policy(VerificationMode::Full),
        };
        let cmd = RsyncExecutor::build_command(&req);
        assert_eq!(cmd.iter().filter(|a| *a == "--checksum").count(), 1);
    }

    #[test]
    fn build_command_does_not_duplicate_checksum_already_present() {
        let req = RsyncRequest {
            dest_namespace: "dst".into(),
            dest_pod_name: "rsync-pod".into(),
            source_node_ip: "10.0.0.5".into(),
            source_ssh_port: 2222,
            private_key_path: "/root/.ssh/id_rsa".into(),
            source_mount_path: "/data/src".into(),
            rsync_options: vec!["--checksum".to_string()],
            bandwidth_limit_kbps: None,
            verification_policy: policy(VerificationMode::Full),
        };
        let cmd = RsyncExecutor::build_command(&req);
        assert_eq!(cmd.iter().filter(|a| *a == "--checksum").count(), 1);
    }

    #[test]
    fn parse_rsync_output_e2e1_clean_sync() {
        let stdout = "Number of regular files transferred: 3\nsent 1,234,890 bytes  received 89 bytes  ... speedup is 1.00\n";
        let stats = parse_rsync_output(stdout);
        assert_eq!(stats.bytes_transferred, 1_234_890);
        assert_eq!(stats.files_transferred, 3);
        assert_eq!(stats.progress, 100);
    }

    #[test]
    fn parse_rsync_output_falls_back_to_xfr_line_count() {
        let stdout = "sent 500 bytes received 10 bytes\n(xfr#1, to-chk=2/5)\n(xfr#2, to-chk=1/5)\ntotal size is 9999\n";
        let stats = parse_rsync_output(stdout);
        assert_eq!(stats.files_transferred, 2);
        assert_eq!(stats.bytes_transferred, 500);
        assert_eq!(stats.progress, 100);
    }

    #[test]
    fn parse_rsync_output_without_completion_markers_has_zero_progress() {
        let stdout = "receiving incremental file list\nfile1.txt\n";
        let stats = parse_rsync_output(stdout);
        assert_eq!(stats.progress, 0);
        assert_eq!(stats.bytes_transferred, 0);
        assert_eq!(stats.files_transferred, 0);
    }

    #[test]
    fn parse_round_trips_through_a_formatted_report() {
        let formatted = format!(
            "Number of regular files transferred: {}\nsent {} bytes  speedup is 2.00\n",
            7, 42_000
        );
        let stats = parse_rsync_output(&formatted);
        assert_eq!(stats.files_transferred, 7);
        assert_eq!(stats.bytes_transferred, 42_000);
        assert_eq!(stats.progress, 100);
    }
}
