//! Plain `serde` views of the fields this crate consumes from the
//! `Mapping` and `RemoteCluster` custom resources (§6). The actual
//! CRD schema, admission validation, and reconcile loop belong to the
//! surrounding controller and are out of scope here — these structs
//! exist only so the sync engine has something concrete to take as
//! input in tests and in `main.rs`'s demo wiring.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig as EngineRetryConfig;
use crate::verify::VerificationMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ReplicationMode {
    Scheduled,
    Continuous,
    Manual,
}

/// Wire representation of `retryConfig`; `backoff_multiplier` is an
/// integer percent §6 (`200` == `2.0`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfigWire {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default, with = "duration_secs_opt")]
    pub initial_backoff: Option<Duration>,
    #[serde(default, with = "duration_secs_opt")]
    pub max_backoff: Option<Duration>,
    #[serde(default)]
    pub backoff_multiplier: Option<u32>,
}

impl RetryConfigWire {
    pub fn into_engine_config(self) -> EngineRetryConfig {
        EngineRetryConfig::from_wire(
            self.max_retries,
            self.initial_backoff,
            self.max_backoff,
            self.backoff_multiplier,
        )
    }
}

mod duration_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSyncConfig {
    #[serde(default)]
    pub rsync_options: Vec<String>,
    #[serde(default)]
    pub bandwidth_limit_kbps: Option<i64>,
    #[serde(default)]
    pub verification_mode: Option<VerificationMode>,
    #[serde(default)]
    pub sample_percent: Option<u8>,
    #[serde(default, with = "duration_secs_opt")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub name: String,
    pub source_namespace: String,
    pub destination_namespace: String,
    pub replication_mode: ReplicationMode,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub retry_config: Option<RetryConfigWire>,
    #[serde(default)]
    pub data_sync_config: DataSyncConfig,
    #[serde(default)]
    pub temp_pod_key_secret_ref: Option<String>,
}

impl Mapping {
    pub fn retry_config(&self) -> EngineRetryConfig {
        self.retry_config
            .clone()
            .map(RetryConfigWire::into_engine_config)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_port")]
    pub port: i32,
}

fn default_ssh_port() -> i32 {
    2222
}

impl Default for SshConfig {
    fn default() -> Self {
        Self { port: default_ssh_port() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteClusterPvcSync {
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub default_verification_mode: Option<VerificationMode>,
    #[serde(default)]
    pub default_sample_percent: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCluster {
    pub name: String,
    #[serde(default)]
    pub pvc_sync: RemoteClusterPvcSync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_config_wire_converts_percent_multiplier_through_mapping() {
        let mapping = Mapping {
            name: "m1".into(),
            source_namespace: "src".into(),
            destination_namespace: "dst".into(),
            replication_mode: ReplicationMode::Scheduled,
            schedule: None,
            retry_config: Some(RetryConfigWire {
                max_retries: Some(8),
                initial_backoff: None,
                max_backoff: None,
                backoff_multiplier: Some(150),
            }),
            data_sync_config: DataSyncConfig::default(),
            temp_pod_key_secret_ref: None,
        };
        let cfg = mapping.retry_config();
        assert_eq!(cfg.max_retries, 8);
        assert_eq!(cfg.multiplier, 1.5);
    }

    #[test]
    fn missing_retry_config_falls_back_to_defaults() {
        let mapping = Mapping {
            name: "m1".into(),
            source_namespace: "src".into(),
            destination_namespace: "dst".into(),
            replication_mode: ReplicationMode::Manual,
            schedule: None,
            retry_config: None,
            data_sync_config: DataSyncConfig::default(),
            temp_pod_key_secret_ref: None,
        };
        assert_eq!(mapping.retry_config(), EngineRetryConfig::default());
    }

    #[test]
    fn remote_cluster_ssh_port_defaults_to_2222() {
        let json = r#"{"name": "remote-1", "pvcSync": {}}"#;
        let rc: RemoteCluster = serde_json::from_str(json).unwrap();
        assert_eq!(rc.pvc_sync.ssh.port, 2222);
    }

    #[test]
    fn remote_cluster_ssh_port_honors_explicit_value() {
        let json = r#"{"name": "remote-1", "pvcSync": {"ssh": {"port": 22}}}"#;
        let rc: RemoteCluster = serde_json::from_str(json).unwrap();
        assert_eq!(rc.pvc_sync.ssh.port, 22);
    }
}
