//! Interval scheduler for policy snapshots.
//!
//! Each policy's timeline is cut into slots of `schedule_interval`; the slot
//! containing `now` is `floor(now / interval)`. A tick captures at most one
//! snapshot per policy per slot. A failed capture leaves the slot unmarked so
//! the next tick in the same slot tries again.

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::snapshot::{SnapshotManager, SweepReport, SYSTEM_ACTOR};
use crate::types::{PolicyId, SnapshotId};
use crate::worm::PolicyRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// What a tick did for one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum TickOutcome {
    /// A snapshot was captured for the slot.
    Created { snapshot_id: SnapshotId },
    /// The slot already has its snapshot.
    AlreadyCaptured,
    /// The policy's schedule has ended.
    Inactive,
    /// Capture failed; retried on the next tick.
    Failed { error: String, retryable: bool },
}

/// Result of a tick for one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTick {
    pub policy_id: PolicyId,
    pub policy_name: String,
    pub slot: i64,
    pub outcome: TickOutcome,
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub policies: Vec<PolicyTick>,
}

impl TickReport {
    /// Snapshots created by this tick.
    pub fn created(&self) -> Vec<SnapshotId> {
        self.policies
            .iter()
            .filter_map(|p| match p.outcome {
                TickOutcome::Created { snapshot_id } => Some(snapshot_id),
                _ => None,
            })
            .collect()
    }

    /// Number of failed captures.
    pub fn failures(&self) -> usize {
        self.policies
            .iter()
            .filter(|p| matches!(p.outcome, TickOutcome::Failed { .. }))
            .count()
    }
}

/// Scheduler state for one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRunState {
    /// Policy ID.
    pub policy_id: PolicyId,
    /// Last slot with a snapshot.
    pub last_slot: Option<i64>,
    /// Last tick that attempted a capture.
    pub last_run: Option<DateTime<Utc>>,
    /// Result of that attempt.
    pub last_result: Option<TickOutcome>,
    /// Total successful captures.
    pub success_count: u64,
    /// Total failed captures.
    pub failure_count: u64,
}

impl PolicyRunState {
    fn new(policy_id: PolicyId) -> Self {
        Self {
            policy_id,
            last_slot: None,
            last_run: None,
            last_result: None,
            success_count: 0,
            failure_count: 0,
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub tracked_policies: usize,
    pub successful_captures: u64,
    pub failed_captures: u64,
}

/// Single logical scheduler for all policies.
pub struct SnapshotScheduler {
    config: SchedulerConfig,
    registry: Arc<PolicyRegistry>,
    manager: Arc<SnapshotManager>,
    clock: Arc<dyn Clock>,
    states: RwLock<HashMap<PolicyId, PolicyRunState>>,
    /// Serializes ticks.
    ticking: Mutex<()>,
}

impl SnapshotScheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<PolicyRegistry>,
        manager: Arc<SnapshotManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            manager,
            clock,
            states: RwLock::new(HashMap::new()),
            ticking: Mutex::new(()),
        }
    }

    /// Marks the slot of each policy's newest stored snapshot as captured.
    pub async fn seed_from_store(&self) -> Result<usize> {
        let mut seeded = 0;
        for policy in self.registry.list().await {
            if let Some(latest) = self.manager.latest(policy.id()).await? {
                let slot = policy.slot(latest.created_at());
                let mut states = self.states.write().await;
                let state = states
                    .entry(policy.id())
                    .or_insert_with(|| PolicyRunState::new(policy.id()));
                if state.last_slot.map_or(true, |s| s < slot) {
                    state.last_slot = Some(slot);
                    seeded += 1;
                }
            }
        }
        debug!(policies = seeded, "Seeded scheduler slots from store");
        Ok(seeded)
    }

    /// Captures a snapshot for every active policy whose current slot has none.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let _ticking = self.ticking.lock().await;
        let mut report = TickReport {
            at: now,
            policies: Vec::new(),
        };

        for policy in self.registry.list().await {
            let policy_id = policy.id();
            let slot = policy.slot(now);

            let outcome = if !policy.is_active(now) {
                debug!(policy_id = %policy_id, "Policy schedule has ended");
                TickOutcome::Inactive
            } else if self.slot_captured(policy_id, slot).await {
                debug!(policy_id = %policy_id, slot, "Slot already captured");
                TickOutcome::AlreadyCaptured
            } else {
                self.capture(policy_id, slot, now).await
            };

            report.policies.push(PolicyTick {
                policy_id,
                policy_name: policy.name().to_string(),
                slot,
                outcome,
            });
        }

        report
    }

    async fn slot_captured(&self, policy_id: PolicyId, slot: i64) -> bool {
        self.states
            .read()
            .await
            .get(&policy_id)
            .and_then(|s| s.last_slot)
            .map_or(false, |last| last >= slot)
    }

    async fn capture(&self, policy_id: PolicyId, slot: i64, now: DateTime<Utc>) -> TickOutcome {
        let result = self.manager.create_at(policy_id, SYSTEM_ACTOR, now).await;

        let mut states = self.states.write().await;
        let state = states
            .entry(policy_id)
            .or_insert_with(|| PolicyRunState::new(policy_id));
        state.last_run = Some(now);

        let outcome = match result {
            Ok(snapshot) => {
                state.last_slot = Some(slot);
                state.success_count += 1;
                info!(
                    policy_id = %policy_id,
                    snapshot_id = %snapshot.id(),
                    slot,
                    "Scheduled snapshot created"
                );
                TickOutcome::Created {
                    snapshot_id: snapshot.id(),
                }
            }
            Err(e) => {
                state.failure_count += 1;
                warn!(
                    policy_id = %policy_id,
                    slot,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Scheduled snapshot failed"
                );
                TickOutcome::Failed {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                }
            }
        };
        state.last_result = Some(outcome.clone());
        outcome
    }

    /// Runs one tick, then an expiry sweep if configured.
    pub async fn run_once(&self, now: DateTime<Utc>) -> (TickReport, Option<SweepReport>) {
        let report = self.tick(now).await;
        if !self.config.sweep_expired {
            return (report, None);
        }

        match self.manager.sweep_expired(now, self.config.purge_expired).await {
            Ok(sweep) => (report, Some(sweep)),
            Err(e) => {
                error!(error = %e, "Expiry sweep failed");
                (report, None)
            }
        }
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if !self.config.enabled {
            info!("Snapshot scheduler is disabled");
            return Ok(());
        }

        self.seed_from_store().await?;
        info!(
            tick_interval = ?self.config.tick_interval,
            sweep_expired = self.config.sweep_expired,
            purge_expired = self.config.purge_expired,
            "Snapshot scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once(self.clock.now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Snapshot scheduler shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Get the run state of one policy.
    pub async fn policy_state(&self, policy_id: PolicyId) -> Option<PolicyRunState> {
        self.states.read().await.get(&policy_id).cloned()
    }

    /// Get statistics.
    pub async fn stats(&self) -> SchedulerStats {
        let states = self.states.read().await;
        SchedulerStats {
            tracked_policies: states.len(),
            successful_captures: states.values().map(|s| s.success_count).sum(),
            failed_captures: states.values().map(|s| s.failure_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::snapshot::{MemorySnapshotStore, SnapshotStore};
    use crate::source::MemoryDataSource;
    use crate::types::TrackedObjectSet;
    use crate::worm::{AuditLog, PolicySpec};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        source: Arc<MemoryDataSource>,
        store: Arc<dyn SnapshotStore>,
        registry: Arc<PolicyRegistry>,
        manager: Arc<SnapshotManager>,
        scheduler: SnapshotScheduler,
        policy_id: PolicyId,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::at_epoch());
        let registry = Arc::new(PolicyRegistry::in_memory());
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
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

        let manager = Arc::new(SnapshotManager::new(
            registry.clone(),
            store.clone(),
            source.clone(),
            Arc::new(AuditLog::in_memory()),
            clock.clone(),
        ));
        let scheduler = SnapshotScheduler::new(
            SchedulerConfig::default(),
            registry.clone(),
            manager.clone(),
            clock.clone(),
        );

        Fixture {
            clock,
            source,
            store,
            registry,
            manager,
            scheduler,
            policy_id: policy.id(),
        }
    }

    #[tokio::test]
    async fn test_one_snapshot_per_slot() {
        let f = fixture().await;

        let first = f.scheduler.tick(f.clock.now()).await;
        assert_eq!(first.created().len(), 1);

        let again = f.scheduler.tick(f.clock.advance(ChronoDuration::hours(5))).await;
        assert!(again.created().is_empty());
        assert_eq!(again.policies[0].outcome, TickOutcome::AlreadyCaptured);

        let next = f.scheduler.tick(f.clock.advance(ChronoDuration::hours(1))).await;
        assert_eq!(next.created().len(), 1);
        assert_eq!(next.policies[0].slot, 1);

        assert_eq!(f.store.list_by_policy(f.policy_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_capture_retried_in_same_slot() {
        let f = fixture().await;
        f.source.set_available(false);

        let failed = f.scheduler.tick(f.clock.now()).await;
        assert_eq!(failed.failures(), 1);
        assert!(matches!(
            failed.policies[0].outcome,
            TickOutcome::Failed { retryable: true, .. }
        ));
        assert!(f.store.list().await.unwrap().is_empty());

        f.source.set_available(true);
        let retried = f.scheduler.tick(f.clock.advance(ChronoDuration::minutes(10))).await;
        assert_eq!(retried.created().len(), 1);

        let state = f.scheduler.policy_state(f.policy_id).await.unwrap();
        assert_eq!(state.success_count, 1);
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.last_slot, Some(0));
    }

    #[tokio::test]
    async fn test_ended_policy_is_skipped() {
        let f = fixture().await;
        let ended = f
            .registry
            .create(
                PolicySpec::new(
                    "retired",
                    Duration::from_secs(3600),
                    Duration::from_secs(86_400),
                    TrackedObjectSet::new("clinical", ["patients"]).unwrap(),
                )
                .with_end(f.clock.now()),
                "admin",
                f.clock.now(),
            )
            .await
            .unwrap();

        let report = f.scheduler.tick(f.clock.now()).await;
        let retired = report
            .policies
            .iter()
            .find(|p| p.policy_id == ended.id())
            .unwrap();
        assert_eq!(retired.outcome, TickOutcome::Inactive);
        assert_eq!(report.created().len(), 1);
    }

    #[tokio::test]
    async fn test_seed_prevents_double_capture_after_restart() {
        let f = fixture().await;
        f.manager.create(f.policy_id, "admin").await.unwrap();

        let restarted = SnapshotScheduler::new(
            SchedulerConfig::default(),
            f.registry.clone(),
            f.manager.clone(),
            f.clock.clone(),
        );
        assert_eq!(restarted.seed_from_store().await.unwrap(), 1);

        let report = restarted.tick(f.clock.now()).await;
        assert!(report.created().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture().await;
        let scheduler = Arc::new(f.scheduler);
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(scheduler.stats().await.successful_captures, 1);
    }
}
