//! Snapshot creation, deletion and expiry.
//!
//! Every mutating operation holds the owning policy's mutex for its whole
//! duration, including the audit appends, so a snapshot's LOCKED/ACTIVE
//! state is decided against the policy as it stands and audit order follows
//! the order in which operations took effect.

use super::{Snapshot, SnapshotState, SnapshotStore};
use crate::clock::Clock;
use crate::error::{Result, VaultError};
use crate::source::DataSource;
use crate::types::{PolicyId, SnapshotId};
use crate::worm::{AuditEvent, AuditEventType, AuditLog, PolicyRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Actor recorded for scheduler and sweep activity.
pub const SYSTEM_ACTOR: &str = "system";

/// Outcome of an expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Snapshots newly marked EXPIRED.
    pub expired: Vec<SnapshotId>,
    /// Expired snapshots deleted.
    pub purged: Vec<SnapshotId>,
    /// Snapshots that could not be marked or purged.
    pub failures: Vec<(SnapshotId, String)>,
}

/// The snapshot manager.
pub struct SnapshotManager {
    registry: Arc<PolicyRegistry>,
    store: Arc<dyn SnapshotStore>,
    source: Arc<dyn DataSource>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl SnapshotManager {
    /// Create a new snapshot manager.
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

    /// Captures a snapshot of a policy now.
    pub async fn create(&self, policy_id: PolicyId, actor: &str) -> Result<Snapshot> {
        self.create_inner(policy_id, actor, None).await
    }

    /// Captures a snapshot stamped with `now`; used by scheduler ticks.
    pub async fn create_at(
        &self,
        policy_id: PolicyId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Snapshot> {
        self.create_inner(policy_id, actor, Some(now)).await
    }

    async fn create_inner(
        &self,
        policy_id: PolicyId,
        actor: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<Snapshot> {
        let policy = self.registry.lock_policy(policy_id).await?;
        let now = at.unwrap_or_else(|| self.clock.now());

        if !policy.is_active(now) {
            let reason = format!("schedule of policy {} has ended", policy_id);
            self.audit
                .append(
                    AuditEvent::new(AuditEventType::SnapshotCreated, actor, policy_id, now)
                        .with_policy(policy_id)
                        .rejected(reason.clone()),
                )
                .await?;
            return Err(VaultError::InvalidArgument(reason));
        }

        let captured = match self.source.capture(&policy.terms().tracked).await {
            Ok(captured) => captured,
            Err(e) => {
                error!(policy_id = %policy_id, error = %e, "Snapshot capture failed");
                self.audit
                    .append(
                        AuditEvent::new(AuditEventType::SnapshotCreated, actor, policy_id, now)
                            .with_policy(policy_id)
                            .failed(e.to_string()),
                    )
                    .await?;
                return Err(match e {
                    VaultError::CaptureFailed(_) => e,
                    other => VaultError::CaptureFailed(other.to_string()),
                });
            }
        };

        let content_ref = captured.content_ref.clone();
        let saved = match Snapshot::new(&policy, captured, actor, now) {
            Ok(snapshot) => self.store.save(&snapshot).await.map(|_| snapshot),
            Err(e) => Err(e),
        };

        let snapshot = match saved {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(policy_id = %policy_id, error = %e, "Failed to persist snapshot");
                if let Err(discard) = self.source.discard(&content_ref).await {
                    warn!(content = %content_ref, error = %discard, "Failed to discard captured content");
                }
                self.audit
                    .append(
                        AuditEvent::new(AuditEventType::SnapshotCreated, actor, policy_id, now)
                            .with_policy(policy_id)
                            .failed(e.to_string()),
                    )
                    .await?;
                return Err(e);
            }
        };

        let created = AuditEvent::new(AuditEventType::SnapshotCreated, actor, snapshot.id(), now)
            .with_policy(policy_id)
            .with_expiry(snapshot.expires_at())
            .with_metadata(json!({
                "state": snapshot.state(),
                "objects": snapshot.object_count(),
                "bytes": snapshot.total_bytes(),
                "digest": snapshot.digest(),
            }));

        // An unaudited snapshot is withdrawn rather than kept.
        if let Err(e) = self.audit.append(created).await {
            error!(snapshot_id = %snapshot.id(), error = %e, "Failed to audit snapshot, withdrawing it");
            if let Err(delete) = self.store.delete(snapshot.id()).await {
                error!(snapshot_id = %snapshot.id(), error = %delete, "Failed to withdraw snapshot record");
            } else if let Err(discard) = self.source.discard(&content_ref).await {
                warn!(content = %content_ref, error = %discard, "Failed to discard captured content");
            }
            return Err(e);
        }

        info!(
            snapshot_id = %snapshot.id(),
            policy_id = %policy_id,
            state = %snapshot.state(),
            expires_at = %snapshot.expires_at(),
            objects = snapshot.object_count(),
            "Created snapshot"
        );

        Ok(snapshot)
    }

    /// Deletes a snapshot, subject to its retention lock.
    pub async fn delete(&self, snapshot_id: SnapshotId, actor: &str) -> Result<Snapshot> {
        self.delete_inner(snapshot_id, actor, None).await
    }

    async fn delete_inner(
        &self,
        snapshot_id: SnapshotId,
        actor: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<Snapshot> {
        let request_id = Uuid::new_v4();

        let policy_id = match self.store.load(snapshot_id).await? {
            Some(snapshot) => snapshot.policy_id(),
            None => {
                let now = at.unwrap_or_else(|| self.clock.now());
                return self.reject_missing(snapshot_id, actor, request_id, now).await;
            }
        };

        let _policy = self.registry.lock_policy(policy_id).await?;
        let now = at.unwrap_or_else(|| self.clock.now());

        let snapshot = match self.store.load(snapshot_id).await? {
            Some(snapshot) => snapshot,
            None => return self.reject_missing(snapshot_id, actor, request_id, now).await,
        };

        self.audit
            .append(
                AuditEvent::new(AuditEventType::DeleteAttempted, actor, snapshot_id, now)
                    .with_policy(policy_id)
                    .with_expiry(snapshot.expires_at())
                    .with_request(request_id),
            )
            .await?;

        if let Err(e) = snapshot.check_deletable(now) {
            self.audit
                .append(
                    AuditEvent::new(AuditEventType::DeleteRejected, actor, snapshot_id, now)
                        .with_policy(policy_id)
                        .with_expiry(snapshot.expires_at())
                        .with_request(request_id)
                        .rejected(e.to_string()),
                )
                .await?;

            warn!(
                snapshot_id = %snapshot_id,
                actor = %actor,
                expires_at = %snapshot.expires_at(),
                "Deletion rejected by retention lock"
            );
            return Err(e);
        }

        let deleted = AuditEvent::new(AuditEventType::SnapshotDeleted, actor, snapshot_id, now)
            .with_policy(policy_id)
            .with_expiry(snapshot.expires_at())
            .with_request(request_id);

        if let Err(e) = self.store.delete(snapshot_id).await {
            error!(snapshot_id = %snapshot_id, error = %e, "Failed to delete snapshot record");
            self.audit.append(deleted.failed(e.to_string())).await?;
            return Err(e);
        }

        // The record comes back if the deletion cannot be audited; content
        // is only discarded once the audit entry exists.
        if let Err(e) = self.audit.append(deleted).await {
            error!(snapshot_id = %snapshot_id, error = %e, "Failed to audit deletion, restoring record");
            if let Err(restore) = self.store.save(&snapshot).await {
                error!(snapshot_id = %snapshot_id, error = %restore, "Failed to restore snapshot record");
            }
            return Err(e);
        }

        if let Err(e) = self.source.discard(snapshot.content_ref()).await {
            warn!(
                snapshot_id = %snapshot_id,
                content = %snapshot.content_ref(),
                error = %e,
                "Failed to discard snapshot content"
            );
        }

        info!(snapshot_id = %snapshot_id, actor = %actor, "Deleted snapshot");
        Ok(snapshot)
    }

    async fn reject_missing(
        &self,
        snapshot_id: SnapshotId,
        actor: &str,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Snapshot> {
        self.audit
            .append(
                AuditEvent::new(AuditEventType::DeleteAttempted, actor, snapshot_id, now)
                    .with_request(request_id),
            )
            .await?;
        self.audit
            .append(
                AuditEvent::new(AuditEventType::DeleteRejected, actor, snapshot_id, now)
                    .with_request(request_id)
                    .rejected("snapshot not found"),
            )
            .await?;
        Err(VaultError::NotFound(format!("Snapshot {}", snapshot_id)))
    }

    /// Get a snapshot by ID.
    pub async fn get(&self, snapshot_id: SnapshotId) -> Result<Snapshot> {
        self.store
            .load(snapshot_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("Snapshot {}", snapshot_id)))
    }

    /// Snapshots of a policy, newest first.
    pub async fn list_by_policy(&self, policy_id: PolicyId) -> Result<Vec<Snapshot>> {
        self.registry.handle(policy_id).await?;
        self.store.list_by_policy(policy_id).await
    }

    /// All snapshots, newest first.
    pub async fn list(&self) -> Result<Vec<Snapshot>> {
        self.store.list().await
    }

    /// Newest snapshot of a policy, if any.
    pub async fn latest(&self, policy_id: PolicyId) -> Result<Option<Snapshot>> {
        Ok(self.store.list_by_policy(policy_id).await?.into_iter().next())
    }

    /// Marks snapshots past their expiry EXPIRED and, with `purge`, deletes them.
    pub async fn sweep_expired(&self, now: DateTime<Utc>, purge: bool) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for policy in self.registry.list().await {
            let policy_id = policy.id();
            {
                let _policy = self.registry.lock_policy(policy_id).await?;
                for original in self.store.list_by_policy(policy_id).await? {
                    let mut snapshot = original.clone();
                    if !snapshot.mark_expired(now) {
                        continue;
                    }
                    if let Err(e) = self.store.save(&snapshot).await {
                        error!(snapshot_id = %snapshot.id(), error = %e, "Failed to record expiry");
                        report.failures.push((snapshot.id(), e.to_string()));
                        continue;
                    }

                    let expired = AuditEvent::new(
                        AuditEventType::SnapshotExpired,
                        SYSTEM_ACTOR,
                        snapshot.id(),
                        now,
                    )
                    .with_policy(policy_id)
                    .with_expiry(snapshot.expires_at());

                    if let Err(e) = self.audit.append(expired).await {
                        error!(snapshot_id = %snapshot.id(), error = %e, "Failed to audit expiry, reverting mark");
                        if let Err(revert) = self.store.save(&original).await {
                            error!(snapshot_id = %snapshot.id(), error = %revert, "Failed to revert expiry mark");
                        }
                        return Err(e);
                    }
                    debug!(snapshot_id = %snapshot.id(), "Snapshot expired");
                    report.expired.push(snapshot.id());
                }
            }

            if !purge {
                continue;
            }
            for snapshot in self.store.list_by_policy(policy_id).await? {
                if snapshot.state() != SnapshotState::Expired {
                    continue;
                }
                match self.delete_inner(snapshot.id(), SYSTEM_ACTOR, Some(now)).await {
                    Ok(_) => report.purged.push(snapshot.id()),
                    Err(e) => {
                        warn!(snapshot_id = %snapshot.id(), error = %e, "Failed to purge snapshot");
                        report.failures.push((snapshot.id(), e.to_string()));
                    }
                }
            }
        }

        if !report.expired.is_empty() || !report.purged.is_empty() {
            info!(
                expired = report.expired.len(),
                purged = report.purged.len(),
                failures = report.failures.len(),
                "Expiry sweep complete"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::snapshot::MemorySnapshotStore;
    use crate::source::MemoryDataSource;
    use crate::types::TrackedObjectSet;
    use crate::worm::{AuditOutcome, AuditQuery, PolicySpec, RetentionLockAuthority};
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        source: Arc<MemoryDataSource>,
        audit: Arc<AuditLog>,
        authority: RetentionLockAuthority,
        manager: SnapshotManager,
        policy_id: PolicyId,
    }

    async fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemorySnapshotStore::new())).await
    }

    async fn fixture_with_store(store: Arc<dyn SnapshotStore>) -> Fixture {
        let clock = Arc::new(ManualClock::at_epoch());
        let registry = Arc::new(PolicyRegistry::in_memory());
        let audit = Arc::new(AuditLog::in_memory());
        let source = Arc::new(MemoryDataSource::new());
        source.put_object("patients", b"1,Ada".to_vec());

        let policy = registry
            .create(
                PolicySpec::new(
                    "clinical-6h",
                    Duration::from_secs(6 * 3600),
                    Duration::from_secs(90 * 86_400),
                    TrackedObjectSet::new("clinical", ["patients"]).unwrap(),
                ),
                "admin",
                clock.now(),
            )
            .await
            .unwrap();

        let manager = SnapshotManager::new(
            registry.clone(),
            store,
            source.clone(),
            audit.clone(),
            clock.clone(),
        );
        let authority = RetentionLockAuthority::new(registry, audit.clone(), clock.clone());

        Fixture {
            clock,
            source,
            audit,
            authority,
            manager,
            policy_id: policy.id(),
        }
    }

    /// Store whose record deletions always fail.
    struct StuckStore {
        inner: MemorySnapshotStore,
    }

    #[async_trait::async_trait]
    impl SnapshotStore for StuckStore {
        async fn save(&self, snapshot: &Snapshot) -> Result<()> {
            self.inner.save(snapshot).await
        }

        async fn load(&self, snapshot_id: SnapshotId) -> Result<Option<Snapshot>> {
            self.inner.load(snapshot_id).await
        }

        async fn delete(&self, _snapshot_id: SnapshotId) -> Result<()> {
            Err(VaultError::Storage("device is read-only".to_string()))
        }

        async fn list(&self) -> Result<Vec<Snapshot>> {
            self.inner.list().await
        }

        async fn list_by_policy(&self, policy_id: PolicyId) -> Result<Vec<Snapshot>> {
            self.inner.list_by_policy(policy_id).await
        }
    }

    #[tokio::test]
    async fn test_failed_record_delete_is_audited() {
        let f = fixture_with_store(Arc::new(StuckStore {
            inner: MemorySnapshotStore::new(),
        }))
        .await;
        let snapshot = f.manager.create(f.policy_id, "admin").await.unwrap();

        let err = f.manager.delete(snapshot.id(), "admin").await.unwrap_err();
        assert!(matches!(err, VaultError::Storage(_)));
        assert!(f.manager.get(snapshot.id()).await.is_ok());
        assert_eq!(f.source.capture_count(), 1);

        let history = f.audit.history(snapshot.id()).await;
        let types: Vec<_> = history.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                AuditEventType::SnapshotCreated,
                AuditEventType::DeleteAttempted,
                AuditEventType::SnapshotDeleted
            ]
        );
        assert_eq!(history[1].details.request_id, history[2].details.request_id);
        assert!(matches!(history[2].outcome, AuditOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_delete_active_snapshot() {
        let f = fixture().await;
        let snapshot = f.manager.create(f.policy_id, "admin").await.unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Active);

        f.manager.delete(snapshot.id(), "admin").await.unwrap();
        assert!(matches!(
            f.manager.get(snapshot.id()).await,
            Err(VaultError::NotFound(_))
        ));
        assert_eq!(f.source.capture_count(), 0);
    }

    #[tokio::test]
    async fn test_locked_snapshot_rejects_delete_with_audit_pair() {
        let f = fixture().await;
        f.authority.engage_lock(f.policy_id, "officer").await.unwrap();
        let snapshot = f.manager.create(f.policy_id, "scheduler").await.unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Locked);

        let err = f.manager.delete(snapshot.id(), "root").await.unwrap_err();
        assert!(matches!(err, VaultError::RetentionLockViolation { .. }));
        assert!(f.manager.get(snapshot.id()).await.is_ok());

        let history = f.audit.history(snapshot.id()).await;
        let types: Vec<_> = history.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                AuditEventType::SnapshotCreated,
                AuditEventType::DeleteAttempted,
                AuditEventType::DeleteRejected
            ]
        );
        assert_eq!(history[1].details.request_id, history[2].details.request_id);
        assert!(history[1].sequence < history[2].sequence);
    }

    #[tokio::test]
    async fn test_locked_snapshot_deletable_after_expiry() {
        let f = fixture().await;
        f.authority.engage_lock(f.policy_id, "officer").await.unwrap();
        let snapshot = f.manager.create(f.policy_id, "scheduler").await.unwrap();

        f.clock.set(snapshot.expires_at());
        f.manager.delete(snapshot.id(), "admin").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_missing_snapshot_is_audited() {
        let f = fixture().await;
        let missing = SnapshotId::new();

        let err = f.manager.delete(missing, "admin").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));

        let history = f.audit.history(missing).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, AuditEventType::DeleteAttempted);
        assert_eq!(history[1].event_type, AuditEventType::DeleteRejected);
    }

    #[tokio::test]
    async fn test_capture_failure_persists_nothing() {
        let f = fixture().await;
        f.source.set_available(false);

        let err = f.manager.create(f.policy_id, "scheduler").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(f.manager.list_by_policy(f.policy_id).await.unwrap().is_empty());

        let failed = f
            .audit
            .query(&AuditQuery::new().event_type(AuditEventType::SnapshotCreated))
            .await;
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].outcome, AuditOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_lock_is_forward_only() {
        let f = fixture().await;
        let before = f.manager.create(f.policy_id, "scheduler").await.unwrap();
        f.authority.engage_lock(f.policy_id, "officer").await.unwrap();

        assert_eq!(f.manager.get(before.id()).await.unwrap().state(), SnapshotState::Active);
        f.manager.delete(before.id(), "admin").await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_marks_and_purges() {
        let f = fixture().await;
        f.authority.engage_lock(f.policy_id, "officer").await.unwrap();
        let snapshot = f.manager.create(f.policy_id, "scheduler").await.unwrap();

        let early = f.manager.sweep_expired(f.clock.now(), true).await.unwrap();
        assert_eq!(early, SweepReport::default());

        let later = snapshot.expires_at() + chrono::Duration::seconds(1);
        let report = f.manager.sweep_expired(later, false).await.unwrap();
        assert_eq!(report.expired, vec![snapshot.id()]);
        assert!(report.purged.is_empty());
        assert_eq!(
            f.manager.get(snapshot.id()).await.unwrap().state(),
            SnapshotState::Expired
        );

        let report = f.manager.sweep_expired(later, true).await.unwrap();
        assert!(report.expired.is_empty());
        assert_eq!(report.purged, vec![snapshot.id()]);

        let deleted = f
            .audit
            .query(&AuditQuery::new().event_type(AuditEventType::SnapshotDeleted))
            .await;
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].actor, SYSTEM_ACTOR);
    }

    #[tokio::test]
    async fn test_ended_policy_rejects_capture() {
        let f = fixture().await;
        let registry = Arc::new(PolicyRegistry::in_memory());
        let ended = registry
            .create(
                PolicySpec::new(
                    "ended",
                    Duration::from_secs(3600),
                    Duration::from_secs(3600),
                    TrackedObjectSet::new("clinical", ["patients"]).unwrap(),
                )
                .with_end(f.clock.now()),
                "admin",
                f.clock.now(),
            )
            .await
            .unwrap();
        let manager = SnapshotManager::new(
            registry,
            Arc::new(MemorySnapshotStore::new()),
            f.source.clone(),
            f.audit.clone(),
            f.clock.clone(),
        );

        let err = manager.create(ended.id(), "admin").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));
    }
}
