//! Restore engine.
//!
//! Materializes an independent, writable copy of a snapshot's content under
//! a new target name. The source snapshot is only ever read. Every attempt,
//! successful or not, is recorded as a RESTORE_PERFORMED audit event.

use crate::clock::Clock;
use crate::error::{Result, VaultError};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::source::DataSource;
use crate::types::{validate_object_name, PolicyId, SnapshotId};
use crate::worm::{AuditEvent, AuditEventType, AuditLog, PolicyRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Restore options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Replace a live object with the same name.
    pub overwrite: bool,
}

impl RestoreOptions {
    /// Options that replace an existing target.
    pub fn overwriting() -> Self {
        Self { overwrite: true }
    }
}

/// Restore result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Snapshot that was restored.
    pub snapshot_id: SnapshotId,
    /// Target name of the new copy.
    pub target: String,
    /// Backend location of the new copy.
    pub location: String,
    /// Number of objects restored.
    pub objects_restored: u64,
    /// Total bytes restored.
    pub bytes_restored: u64,
    /// Whether an existing target was replaced.
    pub overwritten: bool,
    /// Correlates the audit record of this restore.
    pub request_id: Uuid,
    /// Duration in milliseconds.
    pub duration_ms: u64,
}

/// The restore engine.
pub struct RestoreEngine {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn SnapshotStore>,
    source: Arc<dyn DataSource>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl RestoreEngine {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        store: Arc<dyn SnapshotStore>,
        source: Arc<dyn DataSource>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            source,
            audit,
            clock,
        }
    }

    /// Restores `snapshot_id` into `target`.
    ///
    /// Holds the snapshot's policy mutex so the snapshot cannot be deleted
    /// while its content is being copied.
    pub async fn restore(
        &self,
        snapshot_id: SnapshotId,
        target: &str,
        options: RestoreOptions,
        actor: &str,
    ) -> Result<RestoreResult> {
        let request_id = Uuid::new_v4();
        let start = std::time::Instant::now();

        if let Err(e) = validate_object_name(target) {
            return self
                .reject(snapshot_id, None, target, actor, request_id, self.clock.now(), e)
                .await;
        }

        let policy_id = match self.store.load(snapshot_id).await? {
            Some(snapshot) => snapshot.policy_id(),
            None => {
                let err = VaultError::NotFound(format!("Snapshot {}", snapshot_id));
                return self
                    .reject(snapshot_id, None, target, actor, request_id, self.clock.now(), err)
                    .await;
            }
        };

        let _policy = self.registry.lock_policy(policy_id).await?;
        let now = self.clock.now();

        let snapshot: Snapshot = match self.store.load(snapshot_id).await? {
            Some(snapshot) => snapshot,
            None => {
                let err = VaultError::NotFound(format!("Snapshot {}", snapshot_id));
                return self
                    .reject(snapshot_id, Some(policy_id), target, actor, request_id, now, err)
                    .await;
            }
        };

        let existed = self.source.target_exists(target).await?;
        if existed && !options.overwrite {
            let err = VaultError::TargetExists(target.to_string());
            return self
                .reject(snapshot_id, Some(policy_id), target, actor, request_id, now, err)
                .await;
        }

        let materialized = match self
            .source
            .materialize(snapshot.content_ref(), snapshot.digest(), target, options.overwrite)
            .await
        {
            Ok(materialized) => materialized,
            Err(e @ VaultError::TargetExists(_)) => {
                return self
                    .reject(snapshot_id, Some(policy_id), target, actor, request_id, now, e)
                    .await;
            }
            Err(e) => {
                error!(snapshot_id = %snapshot_id, target = %target, error = %e, "Restore failed");
                self.audit
                    .append(
                        AuditEvent::new(AuditEventType::RestorePerformed, actor, snapshot_id, now)
                            .with_policy(policy_id)
                            .with_target(target)
                            .with_request(request_id)
                            .failed(e.to_string()),
                    )
                    .await?;
                return Err(e);
            }
        };

        self.audit
            .append(
                AuditEvent::new(AuditEventType::RestorePerformed, actor, snapshot_id, now)
                    .with_policy(policy_id)
                    .with_target(target)
                    .with_request(request_id)
                    .with_metadata(json!({
                        "location": materialized.location,
                        "objects": materialized.objects_restored,
                        "bytes": materialized.bytes_restored,
                        "overwritten": existed,
                    })),
            )
            .await?;

        let result = RestoreResult {
            snapshot_id,
            target: materialized.target,
            location: materialized.location,
            objects_restored: materialized.objects_restored,
            bytes_restored: materialized.bytes_restored,
            overwritten: existed,
            request_id,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            snapshot_id = %snapshot_id,
            target = %result.target,
            objects = result.objects_restored,
            bytes = result.bytes_restored,
            actor = %actor,
            "Restore completed"
        );

        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn reject(
        &self,
        snapshot_id: SnapshotId,
        policy_id: Option<PolicyId>,
        target: &str,
        actor: &str,
        request_id: Uuid,
        now: DateTime<Utc>,
        err: VaultError,
    ) -> Result<RestoreResult> {
        let mut event = AuditEvent::new(AuditEventType::RestorePerformed, actor, snapshot_id, now)
            .with_target(target)
            .with_request(request_id)
            .rejected(err.to_string());
        if let Some(policy_id) = policy_id {
            event = event.with_policy(policy_id);
        }
        self.audit.append(event).await?;

        warn!(snapshot_id = %snapshot_id, target = %target, error = %err, "Restore rejected");
        Err(err)
    }
}
