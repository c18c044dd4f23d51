//! Distributed PVC lock (§4.2): two annotations on the source PVC
//! establish exclusive ownership of a sync operation, with a stale-lock
//! takeover protocol and reliance on Kubernetes' own optimistic
//! concurrency (`resourceVersion`) to resolve races between controllers.

use anyhow::Context;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};

pub const LOCK_OWNER_ANNOTATION: &str = "dr-syncer.io/lock-owner";
pub const LOCK_TIMESTAMP_ANNOTATION: &str = "dr-syncer.io/lock-timestamp";
pub const LEGACY_LOCK_ANNOTATION: &str = "dr-syncer.io/replication-lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock (freshly acquired, already held by
    /// the same owner, or taken over from a stale holder).
    Acquired(LockInfo),
    /// Another controller holds a non-stale lock.
    Held(LockInfo),
}

fn lock_is_stale(lock: &LockInfo, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
    now.signed_duration_since(lock.timestamp) > ttl
}

pub struct PvcLock {
    client: Client,
    ttl: chrono::Duration,
}

impl PvcLock {
    pub fn new(client: Client, ttl: std::time::Duration) -> Self {
        Self {
            client,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(60)),
        }
    }

    fn read_lock(pvc: &PersistentVolumeClaim) -> Option<LockInfo> {
        let annotations = pvc.metadata.annotations.as_ref()?;

        if let (Some(owner), Some(ts)) = (
            annotations.get(LOCK_OWNER_ANNOTATION),
            annotations.get(LOCK_TIMESTAMP_ANNOTATION),
        ) {
            if !owner.is_empty() {
                if let Ok(timestamp) = DateTime::parse_from_rfc3339(ts) {
                    return Some(LockInfo {
                        owner: owner.clone(),
                        timestamp: timestamp.with_timezone(&Utc),
                    });
                }
            }
        }

        // Fall back to the legacy combined annotation for read
        // compatibility; the core never writes this form itself.
        let legacy = annotations.get(LEGACY_LOCK_ANNOTATION)?;
        let (owner, ts) = legacy.split_once('|')?;
        if owner.is_empty() {
            return None;
        }
        let timestamp = DateTime::parse_from_rfc3339(ts).ok()?;
        Some(LockInfo {
            owner: owner.to_string(),
            timestamp: timestamp.with_timezone(&Utc),
        })
    }

    fn is_stale(&self, lock: &LockInfo, now: DateTime<Utc>) -> bool {
        lock_is_stale(lock, now, self.ttl)
    }

    /// Attempts to acquire the lock on `namespace/pvc_name` for `owner`.
    /// See §4.2 for the four-branch protocol.
    pub async fn acquire(
        &self,
        namespace: &str,
        pvc_name: &str,
        owner: &str,
    ) -> SyncResult<LockOutcome> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let mut pvc = api
            .get(pvc_name)
            .await
            .context("failed to read PVC for lock acquisition")
            .map_err(SyncError::fatal)?;

        let now = Utc::now();
        let existing = Self::read_lock(&pvc);

        let acquire_with = |pvc: &mut PersistentVolumeClaim, ts: DateTime<Utc>| {
            let annotations = pvc.metadata.annotations.get_or_insert_with(Default::default);
            annotations.insert(LOCK_OWNER_ANNOTATION.to_string(), owner.to_string());
            annotations.insert(LOCK_TIMESTAMP_ANNOTATION.to_string(), ts.to_rfc3339());
            annotations.remove(LEGACY_LOCK_ANNOTATION);
        };

        match existing {
            None => {
                acquire_with(&mut pvc, now);
                api.replace(pvc_name, &PostParams::default(), &pvc)
                    .await
                    .context("failed to write lock annotations")
                    .map_err(SyncError::fatal)?;
                info!(namespace, pvc = pvc_name, owner, "lock acquired");
                Ok(LockOutcome::Acquired(LockInfo {
                    owner: owner.to_string(),
                    timestamp: now,
                }))
            }
            Some(lock) if lock.owner == owner => {
                Ok(LockOutcome::Acquired(lock))
            }
            Some(lock) if self.is_stale(&lock, now) => {
                info!(
                    namespace,
                    pvc = pvc_name,
                    previous_owner = %lock.owner,
                    new_owner = owner,
                    "taking over stale lock"
                );
                acquire_with(&mut pvc, now);
                api.replace(pvc_name, &PostParams::default(), &pvc)
                    .await
                    .context("failed to take over stale lock")
                    .map_err(SyncError::fatal)?;
                Ok(LockOutcome::Acquired(LockInfo {
                    owner: owner.to_string(),
                    timestamp: now,
                }))
            }
            Some(lock) => {
                info!(
                    namespace,
                    pvc = pvc_name,
                    held_by = %lock.owner,
                    "lock held by another controller, skipping"
                );
                Ok(LockOutcome::Held(lock))
            }
        }
    }

    /// Releases the lock on `namespace/pvc_name`, failing (without
    /// deleting anything) if `owner` does not currently hold it.
    pub async fn release(&self, namespace: &str, pvc_name: &str, owner: &str) -> SyncResult<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let mut pvc = api
            .get(pvc_name)
            .await
            .context("failed to read PVC for lock release")
            .map_err(SyncError::cleanup)?;

        match Self::read_lock(&pvc) {
            Some(lock) if lock.owner == owner => {
                if let Some(annotations) = pvc.metadata.annotations.as_mut() {
                    annotations.remove(LOCK_OWNER_ANNOTATION);
                    annotations.remove(LOCK_TIMESTAMP_ANNOTATION);
                    annotations.remove(LEGACY_LOCK_ANNOTATION);
                }
                api.replace(pvc_name, &PostParams::default(), &pvc)
                    .await
                    .context("failed to clear lock annotations")
                    .map_err(SyncError::cleanup)?;
                info!(namespace, pvc = pvc_name, owner, "lock released");
                Ok(())
            }
            Some(lock) => {
                warn!(
                    namespace,
                    pvc = pvc_name,
                    held_by = %lock.owner,
                    attempted_by = owner,
                    "refusing to release a lock held by another controller"
                );
                Err(SyncError::cleanup(anyhow::anyhow!(
                    "lock on {}/{} is held by {}, not {owner}",
                    namespace,
                    pvc_name,
                    lock.owner
                )))
            }
            None => {
                warn!(namespace, pvc = pvc_name, "lock already absent on release");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pvc_with_lock(owner: &str, ts: DateTime<Utc>) -> PersistentVolumeClaim {
        let mut annotations = std::collections::BTreeMap::new();
        if !owner.is_empty() {
            annotations.insert(LOCK_OWNER_ANNOTATION.to_string(), owner.to_string());
            annotations.insert(LOCK_TIMESTAMP_ANNOTATION.to_string(), ts.to_rfc3339());
        }
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("test-pvc".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn read_lock_returns_none_when_owner_is_empty() {
        let pvc = pvc_with_lock("", Utc::now());
        assert!(PvcLock::read_lock(&pvc).is_none());
    }

    #[test]
    fn read_lock_parses_present_annotations() {
        let now = Utc::now();
        let pvc = pvc_with_lock("pod-a", now);
        let lock = PvcLock::read_lock(&pvc).unwrap();
        assert_eq!(lock.owner, "pod-a");
        // RFC3339 round-trips to second precision in this format.
        assert!((lock.timestamp - now).num_seconds().abs() <= 1);
    }

    #[test]
    fn read_lock_falls_back_to_legacy_combined_annotation() {
        let now = Utc::now();
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(
            LEGACY_LOCK_ANNOTATION.to_string(),
            format!("legacy-owner|{}", now.to_rfc3339()),
        );
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        let lock = PvcLock::read_lock(&pvc).unwrap();
        assert_eq!(lock.owner, "legacy-owner");
    }

    #[test]
    fn stale_lock_past_ttl_is_detected() {
        let ttl = chrono::Duration::minutes(60);
        let now = Utc::now();
        let stale = LockInfo {
            owner: "pod-x".to_string(),
            timestamp: now - chrono::Duration::hours(2),
        };
        let fresh = LockInfo {
            owner: "pod-x".to_string(),
            timestamp: now - chrono::Duration::minutes(5),
        };
        assert!(lock_is_stale(&stale, now, ttl));
        assert!(!lock_is_stale(&fresh, now, ttl));
    }
}
