//! Verification Engine (§4.8): resolves the effective verification
//! policy for a PVC and, for `Sample` mode, drives an md5 comparison
//! sweep between the destination pod and the source agent over SSH.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::podexec::{self, ExecOutput};
use kube::Client;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    None,
    Sample,
    Full,
}

impl Default for VerificationMode {
    fn default() -> Self {
        VerificationMode::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub mode: VerificationMode,
    pub files_verified: u32,
    pub files_total: u32,
    pub checksum_match: bool,
    pub verified_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl VerificationResult {
    fn skipped() -> Self {
        Self {
            mode: VerificationMode::None,
            files_verified: 0,
            files_total: 0,
            checksum_match: true,
            verified_at: Utc::now(),
            error: None,
        }
    }

    fn full(trusted: bool) -> Self {
        Self {
            mode: VerificationMode::Full,
            files_verified: 0,
            files_total: 0,
            checksum_match: trusted,
            verified_at: Utc::now(),
            error: None,
        }
    }
}

pub const ANN_VERIFICATION_MODE: &str = "dr-syncer.io/verification-mode";
pub const ANN_SAMPLE_PERCENT: &str = "dr-syncer.io/sample-percent";

/// Per-PVC override read from annotations (§4.8 level 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct PvcVerificationOverride {
    pub mode: Option<VerificationMode>,
    pub sample_percent: Option<u8>,
}

impl PvcVerificationOverride {
    /// Parses the `verification-mode`/`sample-percent` annotations off a
    /// PVC's metadata (§6). Unparseable or missing values are
    /// treated as absent rather than erroring, so a malformed
    /// annotation falls through to the mapping/cluster defaults.
    pub fn from_annotations(annotations: Option<&std::collections::BTreeMap<String, String>>) -> Self {
        let Some(annotations) = annotations else {
            return Self::default();
        };
        let mode = annotations.get(ANN_VERIFICATION_MODE).and_then(|v| match v.as_str() {
            "none" => Some(VerificationMode::None),
            "sample" => Some(VerificationMode::Sample),
            "full" => Some(VerificationMode::Full),
            _ => None,
        });
        let sample_percent = annotations
            .get(ANN_SAMPLE_PERCENT)
            .and_then(|v| v.parse::<u8>().ok())
            .filter(|p| (1..=100).contains(p));
        Self { mode, sample_percent }
    }
}

/// Mapping-level defaults (§4.8 level 2).
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingVerificationDefaults {
    pub mode: Option<VerificationMode>,
    pub sample_percent: Option<u8>,
}

/// Source-cluster defaults (§4.8 level 3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterVerificationDefaults {
    pub mode: Option<VerificationMode>,
    pub sample_percent: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub mode: VerificationMode,
    pub sample_percent: u8,
}

const DEFAULT_MODE: VerificationMode = VerificationMode::None;
const DEFAULT_SAMPLE_PERCENT: u8 = 10;

/// Resolves the three-level override chain (§4.8): PVC annotation
/// beats mapping config beats cluster default; absent everywhere falls
/// back to mode=None, samplePercent=10.
pub fn resolve_policy(
    pvc: PvcVerificationOverride,
    mapping: MappingVerificationDefaults,
    cluster: ClusterVerificationDefaults,
) -> EffectivePolicy {
    let mode = pvc
        .mode
        .or(mapping.mode)
        .or(cluster.mode)
        .unwrap_or(DEFAULT_MODE);
    let sample_percent = pvc
        .sample_percent
        .or(mapping.sample_percent)
        .or(cluster.sample_percent)
        .unwrap_or(DEFAULT_SAMPLE_PERCENT);
    EffectivePolicy { mode, sample_percent }
}

pub struct VerificationEngine {
    client: Client,
}

impl VerificationEngine {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Runs verification per `policy` against the destination pod (for
    /// file enumeration and local md5) and the source agent pod (for
    /// remote md5 over SSH), reporting a [`VerificationResult`].
    #[allow(clippy::too_many_arguments)]
    pub async fn verify(
        &self,
        policy: EffectivePolicy,
        dest_namespace: &str,
        dest_pod_name: &str,
        source_node_ip: &str,
        source_ssh_port: i32,
        private_key_path: &str,
        source_mount_path: &str,
    ) -> SyncResult<VerificationResult> {
        match policy.mode {
            VerificationMode::None => Ok(VerificationResult::skipped()),
            VerificationMode::Full => Ok(VerificationResult::full(true)),
            VerificationMode::Sample => {
                self.verify_sample(
                    policy.sample_percent,
                    dest_namespace,
                    dest_pod_name,
                    source_node_ip,
                    source_ssh_port,
                    private_key_path,
                    source_mount_path,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn verify_sample(
        &self,
        sample_percent: u8,
        dest_namespace: &str,
        dest_pod_name: &str,
        source_node_ip: &str,
        source_ssh_port: i32,
        private_key_path: &str,
        source_mount_path: &str,
    ) -> SyncResult<VerificationResult> {
        let list_out = podexec::exec(
            &self.client,
            dest_namespace,
            dest_pod_name,
            vec![
                "find".to_string(),
                "/data".to_string(),
                "-maxdepth".to_string(),
                "20".to_string(),
                "-type".to_string(),
                "f".to_string(),
            ],
            Duration::from_secs(45),
        )
        .await?;

        let mut files = parse_find_file_list(&list_out.stdout);
        files.truncate(1000);
        let files_total = files.len() as u32;
        let sample = sample_files(files, sample_percent);
        let files_verified = sample.len() as u32;

        let mut checksum_match = true;
        let mut error = None;

        for rel_path in &sample {
            let dest_path = format!("/data/{rel_path}");
            let dest_sum = match self.md5_local(dest_namespace, dest_pod_name, &dest_path).await {
                Ok(sum) => sum,
                Err(e) => {
                    error.get_or_insert(format!("checksum lookup failed for {rel_path}: {e}"));
                    continue;
                }
            };

            let source_path = format!("{source_mount_path}/{rel_path}");
            let source_sum = match self
                .md5_remote(
                    dest_namespace,
                    dest_pod_name,
                    source_node_ip,
                    source_ssh_port,
                    private_key_path,
                    &source_path,
                )
                .await
            {
                Ok(sum) => sum,
                Err(e) => {
                    error.get_or_insert(format!("checksum lookup failed for {rel_path}: {e}"));
                    continue;
                }
            };

            if dest_sum != source_sum {
                checksum_match = false;
                error.get_or_insert(format!("checksum mismatch for {rel_path}"));
            }
        }

        Ok(VerificationResult {
            mode: VerificationMode::Sample,
            files_verified,
            files_total,
            checksum_match,
            verified_at: Utc::now(),
            error,
        })
    }

    async fn md5_local(&self, namespace: &str, pod_name: &str, path: &str) -> SyncResult<String> {
        let out: ExecOutput = podexec::exec(
            &self.client,
            namespace,
            pod_name,
            vec!["md5sum".to_string(), path.to_string()],
            Duration::from_secs(30),
        )
        .await?;
        parse_md5sum_output(&out.stdout)
    }

    async fn md5_remote(
        &self,
        namespace: &str,
        pod_name: &str,
        source_node_ip: &str,
        source_ssh_port: i32,
        private_key_path: &str,
        source_path: &str,
    ) -> SyncResult<String> {
        let ssh_cmd = vec![
            "ssh".to_string(),
            "-p".to_string(),
            source_ssh_port.to_string(),
            "-i".to_string(),
            private_key_path.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            format!("root@{source_node_ip}"),
            format!("md5sum {source_path}"),
        ];
        let out = podexec::exec(&self.client, namespace, pod_name, ssh_cmd, Duration::from_secs(30)).await?;
        parse_md5sum_output(&out.stdout)
    }
}

fn parse_find_file_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix("/data/"))
        .map(|rel| rel.to_string())
        .collect()
}

fn parse_md5sum_output(stdout: &str) -> SyncResult<String> {
    stdout
        .split_whitespace()
        .next()
        .map(|s| s.to_string())
        .ok_or_else(|| {
            crate::error::SyncError::fatal(anyhow::anyhow!("unparseable md5sum output: {stdout:?}"))
        })
}

/// Random-shuffles `files` and takes `⌈N·pct/100⌉` clamped to `[1, N]`
/// (§4.8). Empty input yields an empty sample.
fn sample_files(mut files: Vec<String>, sample_percent: u8) -> Vec<String> {
    if files.is_empty() {
        return files;
    }
    let n = files.len();
    let count = ((n as f64) * (sample_percent as f64) / 100.0).ceil() as usize;
    let count = count.clamp(1, n);
    files.shuffle(&mut rand::thread_rng());
    files.truncate(count);
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_policy_prefers_pvc_annotation_over_mapping_and_cluster() {
        let policy = resolve_policy(
            PvcVerificationOverride { mode: Some(VerificationMode::Full), sample_percent: None },
            MappingVerificationDefaults { mode: Some(VerificationMode::Sample), sample_percent: Some(50) },
            ClusterVerificationDefaults { mode: Some(VerificationMode::None), sample_percent: Some(5) },
        );
        assert_eq!(policy.mode, VerificationMode::Full);
        assert_eq!(policy.sample_percent, 50);
    }

    #[test]
    fn resolve_policy_falls_back_to_defaults_when_everything_absent() {
        let policy = resolve_policy(
            PvcVerificationOverride::default(),
            MappingVerificationDefaults::default(),
            ClusterVerificationDefaults::default(),
        );
        assert_eq!(policy.mode, VerificationMode::None);
        assert_eq!(policy.sample_percent, 10);
    }

    #[test]
    fn resolve_policy_falls_through_to_cluster_default_when_pvc_and_mapping_absent() {
        let policy = resolve_policy(
            PvcVerificationOverride::default(),
            MappingVerificationDefaults::default(),
            ClusterVerificationDefaults { mode: Some(VerificationMode::Sample), sample_percent: Some(25) },
        );
        assert_eq!(policy.mode, VerificationMode::Sample);
        assert_eq!(policy.sample_percent, 25);
    }

    #[test]
    fn sample_files_rounds_up_and_clamps_to_at_least_one() {
        let files: Vec<String> = (0..50).map(|i| format!("f{i}")).collect();
        let sample = sample_files(files, 10);
        assert_eq!(sample.len(), 5);

        let one = sample_files(vec!["only".to_string()], 1);
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn sample_files_on_empty_input_is_empty() {
        assert!(sample_files(vec![], 50).is_empty());
    }

    #[test]
    fn parse_find_file_list_strips_data_prefix() {
        let stdout = "/data/a.txt\n/data/sub/b.txt\n";
        let files = parse_find_file_list(stdout);
        assert_eq!(files, vec!["a.txt".to_string(), "sub/b.txt".to_string()]);
    }

    #[test]
    fn parse_md5sum_output_takes_first_field() {
        let sum = parse_md5sum_output("d41d8cd98f00b204e9800998ecf8427e  /data/a.txt\n").unwrap();
        assert_eq!(sum, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn parse_md5sum_output_rejects_empty_string() {
        assert!(parse_md5sum_output("").is_err());
    }

    #[test]
    fn pvc_override_parses_valid_annotations() {
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(ANN_VERIFICATION_MODE.to_string(), "sample".to_string());
        annotations.insert(ANN_SAMPLE_PERCENT.to_string(), "25".to_string());
        let over = PvcVerificationOverride::from_annotations(Some(&annotations));
        assert_eq!(over.mode, Some(VerificationMode::Sample));
        assert_eq!(over.sample_percent, Some(25));
    }

    #[test]
    fn pvc_override_rejects_out_of_range_sample_percent() {
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(ANN_SAMPLE_PERCENT.to_string(), "150".to_string());
        let over = PvcVerificationOverride::from_annotations(Some(&annotations));
        assert_eq!(over.sample_percent, None);
    }

    #[test]
    fn pvc_override_is_default_when_annotations_absent() {
        let over = PvcVerificationOverride::from_annotations(None);
        assert!(over.mode.is_none());
        assert!(over.sample_percent.is_none());
    }
}
