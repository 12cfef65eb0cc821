//! The vault: policies, snapshots, restores and the audit log behind one handle.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vaultlock::clock::ManualClock;
//! use vaultlock::config::VaultConfig;
//! use vaultlock::source::MemoryDataSource;
//! use vaultlock::types::TrackedObjectSet;
//! use vaultlock::worm::PolicySpec;
//! use vaultlock::{Vault, VaultError};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let source = Arc::new(MemoryDataSource::new());
//! source.put_object("patients", b"1,Ada".to_vec());
//!
//! let vault = Vault::open_with(VaultConfig::default(), Arc::new(ManualClock::at_epoch()), source)
//!     .await
//!     .unwrap();
//!
//! let tracked = TrackedObjectSet::new("clinical", ["patients"]).unwrap();
//! let spec = PolicySpec::new("hourly", Duration::from_secs(3600), Duration::from_secs(86_400), tracked);
//! let policy = vault.create_policy(spec, "admin").await.unwrap();
//!
//! vault.engage_lock(policy.id(), "officer").await.unwrap();
//! let snapshot = vault.create_snapshot(policy.id(), "admin").await.unwrap();
//!
//! let err = vault.delete_snapshot(snapshot.id(), "root").await.unwrap_err();
//! assert!(matches!(err, VaultError::RetentionLockViolation { .. }));
//! # });
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::humantime_serde::format_duration;
use crate::config::VaultConfig;
use crate::error::Result;
use crate::persist::StateLock;
use crate::restore::{RestoreEngine, RestoreOptions, RestoreResult};
use crate::scheduling::{SnapshotScheduler, TickReport};
use crate::snapshot::{
    FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotManager, SnapshotStore, SweepReport,
    SYSTEM_ACTOR,
};
use crate::source::{DataSource, DirectoryDataSource, MemoryDataSource};
use crate::types::{PolicyId, SnapshotId};
use crate::worm::{
    AuditEvent, AuditEventType, AuditLog, AuditQuery, AuditReport, PolicyRegistry, PolicySpec,
    RetentionLockAuthority, RetentionPolicy,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A policy-driven snapshot vault.
pub struct Vault {
    config: VaultConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<PolicyRegistry>,
    audit: Arc<AuditLog>,
    snapshots: Arc<SnapshotManager>,
    locks: RetentionLockAuthority,
    restores: RestoreEngine,
    scheduler: SnapshotScheduler,
    /// Held for the vault's lifetime when state is durable
    _state_lock: Option<StateLock>,
}

impl Vault {
    /// Opens a vault on the wall clock with the data source `config` selects.
    pub async fn open(config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn DataSource> =
            match (&config.storage.data_dir, config.storage.content_dir()) {
                (Some(data_dir), Some(content_dir)) => {
                    Arc::new(DirectoryDataSource::new(data_dir, content_dir)?)
                }
                _ => Arc::new(MemoryDataSource::new()),
            };
        Self::open_with(config, Arc::new(SystemClock), source).await
    }

    /// Opens a vault with an explicit clock and data source.
    pub async fn open_with(
        config: VaultConfig,
        clock: Arc<dyn Clock>,
        source: Arc<dyn DataSource>,
    ) -> Result<Self> {
        config.validate()?;

        let storage = &config.storage;
        let state_lock = storage
            .state_dir
            .as_deref()
            .map(StateLock::acquire)
            .transpose()?;

        let (registry, store, audit): (PolicyRegistry, Arc<dyn SnapshotStore>, AuditLog) = match (
            storage.policies_dir(),
            storage.snapshots_dir(),
            storage.audit_path(),
        ) {
            (Some(policies), Some(snapshots), Some(audit)) => (
                PolicyRegistry::open(policies)?,
                Arc::new(FileSnapshotStore::open(snapshots)?),
                AuditLog::open(audit)?,
            ),
            _ => (
                PolicyRegistry::in_memory(),
                Arc::new(MemorySnapshotStore::new()),
                AuditLog::in_memory(),
            ),
        };

        let registry = Arc::new(registry);
        let audit = Arc::new(audit);

        let snapshots = Arc::new(SnapshotManager::new(
            registry.clone(),
            store.clone(),
            source.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let locks = RetentionLockAuthority::new(registry.clone(), audit.clone(), clock.clone());
        let restores = RestoreEngine::new(
            registry.clone(),
            store,
            source.clone(),
            audit.clone(),
            clock.clone(),
        );
        let scheduler = SnapshotScheduler::new(
            config.scheduler.clone(),
            registry.clone(),
            snapshots.clone(),
            clock.clone(),
        );

        let vault = Self {
            config,
            clock,
            registry,
            audit,
            snapshots,
            locks,
            restores,
            scheduler,
            _state_lock: state_lock,
        };

        vault.bootstrap_policies().await?;
        vault.scheduler.seed_from_store().await?;

        info!(
            policies = vault.registry.len().await,
            source = source.kind(),
            durable = vault.config.storage.state_dir.is_some(),
            "Vault opened"
        );
        Ok(vault)
    }

    async fn bootstrap_policies(&self) -> Result<()> {
        for spec in self.config.policies.clone() {
            if self.registry.resolve(&spec.name).await.is_ok() {
                continue;
            }
            self.create_policy(spec, SYSTEM_ACTOR).await?;
        }
        Ok(())
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn scheduler(&self) -> &SnapshotScheduler {
        &self.scheduler
    }

    /// Creates a policy. Rejected requests are audited under the requested name.
    pub async fn create_policy(&self, spec: PolicySpec, actor: &str) -> Result<RetentionPolicy> {
        let now = self.clock.now();
        let name = spec.name.clone();
        let metadata = json!({
            "name": spec.name,
            "schedule_interval": format_duration(spec.schedule_interval),
            "retention": format_duration(spec.retention),
            "tracked_set": spec.tracked.name(),
            "objects": spec.tracked.objects(),
            "classification": spec.tracked.classification(),
        });

        match self.registry.create(spec, actor, now).await {
            Ok(policy) => {
                self.audit
                    .append(
                        AuditEvent::new(AuditEventType::PolicyCreated, actor, policy.id(), now)
                            .with_policy(policy.id())
                            .with_metadata(metadata),
                    )
                    .await?;
                Ok(policy)
            }
            Err(e) => {
                self.audit
                    .append(
                        AuditEvent::new(AuditEventType::PolicyCreated, actor, &name, now)
                            .with_metadata(metadata)
                            .rejected(e.to_string()),
                    )
                    .await?;
                warn!(name = %name, actor = %actor, error = %e, "Policy creation rejected");
                Err(e)
            }
        }
    }

    /// Looks up a policy by id or name.
    pub async fn policy(&self, id_or_name: &str) -> Result<RetentionPolicy> {
        let id = self.registry.resolve(id_or_name).await?;
        self.registry.get(id).await
    }

    pub async fn resolve_policy(&self, id_or_name: &str) -> Result<PolicyId> {
        self.registry.resolve(id_or_name).await
    }

    /// All policies, oldest first.
    pub async fn list_policies(&self) -> Vec<RetentionPolicy> {
        self.registry.list().await
    }

    /// Engages the irreversible retention lock.
    pub async fn engage_lock(&self, policy_id: PolicyId, actor: &str) -> Result<RetentionPolicy> {
        self.locks.engage_lock(policy_id, actor).await
    }

    /// Changes retention for future snapshots of an unlocked policy.
    pub async fn update_retention(
        &self,
        policy_id: PolicyId,
        retention: Duration,
        actor: &str,
    ) -> Result<RetentionPolicy> {
        self.locks.update_retention(policy_id, retention, actor).await
    }

    /// Captures a snapshot now, outside the schedule.
    pub async fn create_snapshot(&self, policy_id: PolicyId, actor: &str) -> Result<Snapshot> {
        self.snapshots.create(policy_id, actor).await
    }

    pub async fn delete_snapshot(&self, snapshot_id: SnapshotId, actor: &str) -> Result<Snapshot> {
        self.snapshots.delete(snapshot_id, actor).await
    }

    pub async fn get_snapshot(&self, snapshot_id: SnapshotId) -> Result<Snapshot> {
        self.snapshots.get(snapshot_id).await
    }

    /// Snapshots of a policy, newest first.
    pub async fn list_snapshots(&self, policy_id: PolicyId) -> Result<Vec<Snapshot>> {
        self.snapshots.list_by_policy(policy_id).await
    }

    /// All snapshots, newest first.
    pub async fn list_all_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.snapshots.list().await
    }

    pub async fn restore(
        &self,
        snapshot_id: SnapshotId,
        target: &str,
        options: RestoreOptions,
        actor: &str,
    ) -> Result<RestoreResult> {
        self.restores.restore(snapshot_id, target, options, actor).await
    }

    /// Audit events matching `query`, in (timestamp, sequence) order.
    pub async fn audit_events(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        self.audit.query(query).await
    }

    pub async fn export_audit(&self, query: &AuditQuery) -> Result<String> {
        self.audit.export_json(query).await
    }

    pub async fn audit_report(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> AuditReport {
        AuditReport::generate(&self.audit, from, to, self.clock.now()).await
    }

    /// Runs one scheduler tick at the current time.
    pub async fn tick(&self) -> TickReport {
        self.scheduler.tick(self.clock.now()).await
    }

    /// Marks expired snapshots, purging them if configured.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        self.snapshots
            .sweep_expired(self.clock.now(), self.config.scheduler.purge_expired)
            .await
    }

    /// Runs the scheduler until `shutdown` fires.
    pub async fn serve(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.scheduler.run(shutdown).await
    }
}
