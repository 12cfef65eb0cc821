//! End-to-end lifecycle tests
//!
//! Drives a vault through scheduling, locking, deletion and restore on a
//! manual clock.

#[allow(dead_code)]
mod common;

use common::*;
use std::sync::Arc;
use vaultlock::restore::RestoreOptions;
use vaultlock::scheduling::TickOutcome;
use vaultlock::snapshot::SnapshotState;
use vaultlock::worm::{AuditEventType, AuditOutcome, AuditQuery};
use vaultlock::VaultError;

// =============================================================================
// Lock Lifecycle
// =============================================================================

#[tokio::test]
async fn test_six_hour_ninety_day_scenario() {
    let t = TestVault::new().await;
    let policy = t.create_policy("clinical-6h", hours(6), days(90)).await;

    // t=0: first slot captured before the lock
    let report = t.vault.tick().await;
    let s1 = report.created()[0];
    assert_eq!(t.vault.get_snapshot(s1).await.unwrap().state(), SnapshotState::Active);

    // t=1h: lock engaged
    t.set_time(hours(1));
    let locked = t.vault.engage_lock(policy.id(), OFFICER).await.unwrap();
    assert!(locked.is_locked());

    // t=2h: pre-lock snapshot is still deletable
    t.set_time(hours(2));
    t.vault.delete_snapshot(s1, ADMIN).await.unwrap();

    // t=6h: next slot is captured under the lock
    t.set_time(hours(6));
    let report = t.vault.tick().await;
    let s2 = report.created()[0];
    let snapshot = t.vault.get_snapshot(s2).await.unwrap();
    assert_eq!(snapshot.state(), SnapshotState::Locked);
    assert!(snapshot.retention_locked());
    assert_eq!(snapshot.expires_at(), at(hours(6) + days(90)));

    // t=8h: no caller can delete it
    t.set_time(hours(8));
    for actor in [ADMIN, "root", OFFICER] {
        let err = t.vault.delete_snapshot(s2, actor).await.unwrap_err();
        assert!(matches!(err, VaultError::RetentionLockViolation { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    // One second before expiry: still locked
    t.set_time(hours(6) + days(90) - std::time::Duration::from_secs(1));
    assert!(t.vault.delete_snapshot(s2, ADMIN).await.is_err());

    // t=90d+6h+1s: retention has run out
    t.set_time(hours(6) + days(90) + std::time::Duration::from_secs(1));
    t.vault.delete_snapshot(s2, ADMIN).await.unwrap();

    assert!(matches!(
        t.vault.get_snapshot(s2).await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_every_rejection_has_a_matching_attempt() {
    let t = TestVault::new().await;
    let policy = t.create_policy("clinical-daily", days(1), days(30)).await;
    t.vault.engage_lock(policy.id(), OFFICER).await.unwrap();
    let snapshot = t.vault.create_snapshot(policy.id(), ADMIN).await.unwrap();

    for actor in ["root", "dba", ADMIN] {
        t.vault.delete_snapshot(snapshot.id(), actor).await.unwrap_err();
    }

    let events = t
        .vault
        .audit_events(&AuditQuery::new().subject(snapshot.id()))
        .await;
    let rejections: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::DeleteRejected)
        .collect();
    assert_eq!(rejections.len(), 3);

    for rejection in rejections {
        let request_id = rejection.details.request_id.unwrap();
        let attempt = events
            .iter()
            .find(|e| {
                e.event_type == AuditEventType::DeleteAttempted
                    && e.details.request_id == Some(request_id)
            })
            .expect("rejection without a preceding attempt");
        assert!(attempt.sequence < rejection.sequence);
        assert_eq!(attempt.subject_id, rejection.subject_id);
        assert_eq!(attempt.actor, rejection.actor);
        assert!(matches!(rejection.outcome, AuditOutcome::Rejected { .. }));
    }
}

#[tokio::test]
async fn test_concurrent_lock_has_one_winner() {
    let t = Arc::new(TestVault::new().await);
    let policy = t.create_policy("clinical-6h", hours(6), days(90)).await;

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let t = t.clone();
            let id = policy.id();
            tokio::spawn(async move { t.vault.engage_lock(id, &format!("officer-{}", i)).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(matches!(e, VaultError::AlreadyLocked(_))),
        }
    }
    assert_eq!(winners, 1);

    let engaged = t
        .vault
        .audit_events(&AuditQuery::new().event_type(AuditEventType::LockEngaged))
        .await;
    assert_eq!(engaged.len(), 1);

    let repeats = t
        .vault
        .audit_events(&AuditQuery::new().event_type(AuditEventType::LockAlreadyEngaged))
        .await;
    assert_eq!(repeats.len(), 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshots_racing_the_lock_follow_audit_order() {
    for round in 0..64 {
        let t = Arc::new(TestVault::new().await);
        let policy = t.create_policy("clinical-6h", hours(6), days(90)).await;
        let id = policy.id();

        let clock = {
            let t = t.clone();
            tokio::spawn(async move {
                for _ in 0..8 {
                    t.clock.advance(chrono::Duration::seconds(1));
                    tokio::task::yield_now().await;
                }
            })
        };
        let lock = {
            let t = t.clone();
            tokio::spawn(async move { t.vault.engage_lock(id, OFFICER).await })
        };
        let tick = {
            let t = t.clone();
            tokio::spawn(async move { t.vault.tick().await.created() })
        };
        let creates: Vec<_> = (0..4)
            .map(|_| {
                let t = t.clone();
                tokio::spawn(async move { t.vault.create_snapshot(id, ADMIN).await })
            })
            .collect();

        clock.await.unwrap();
        lock.await.unwrap().unwrap();
        let mut expected = tick.await.unwrap().len();
        for create in creates {
            create.await.unwrap().unwrap();
            expected += 1;
        }

        let locked_at = t
            .vault
            .policy("clinical-6h")
            .await
            .unwrap()
            .locked_at()
            .unwrap();
        let events = t.vault.audit_events(&AuditQuery::new()).await;
        let lock_seq = events
            .iter()
            .find(|e| e.event_type == AuditEventType::LockEngaged)
            .unwrap()
            .sequence;

        let snapshots = t.vault.list_all_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), expected, "round {}", round);
        for snapshot in snapshots {
            let created = events
                .iter()
                .find(|e| {
                    e.event_type == AuditEventType::SnapshotCreated
                        && e.outcome.is_success()
                        && e.subject_id == snapshot.id().to_string()
                })
                .expect("snapshot without a creation entry");
            let locked = snapshot.state() == SnapshotState::Locked;

            assert_eq!(locked, created.sequence > lock_seq, "round {}", round);
            if snapshot.created_at() > locked_at {
                assert!(locked, "round {}: taken after the lock but unlocked", round);
            }
        }
    }
}

#[tokio::test]
async fn test_retention_frozen_after_lock() {
    let t = TestVault::new().await;
    let policy = t.create_policy("clinical-6h", hours(6), days(90)).await;

    let updated = t
        .vault
        .update_retention(policy.id(), days(120), ADMIN)
        .await
        .unwrap();
    assert_eq!(updated.terms().retention, days(120));

    t.vault.engage_lock(policy.id(), OFFICER).await.unwrap();
    let err = t
        .vault
        .update_retention(policy.id(), days(1), ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::PolicyLocked(_)));
    assert_eq!(err.exit_code(), 8);

    let policy = t.vault.policy("clinical-6h").await.unwrap();
    assert_eq!(policy.terms().retention, days(120));
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_one_snapshot_per_slot() {
    let t = TestVault::new().await;
    t.create_policy("hourly", hours(1), days(7)).await;

    t.vault.tick().await;
    t.set_time(std::time::Duration::from_secs(30 * 60));
    let report = t.vault.tick().await;
    assert_eq!(report.policies[0].outcome, TickOutcome::AlreadyCaptured);

    t.set_time(hours(1));
    assert_eq!(t.vault.tick().await.created().len(), 1);
    assert_eq!(t.vault.list_all_snapshots().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_capture_retried_on_next_tick() {
    let t = TestVault::new().await;
    t.create_policy("hourly", hours(1), days(7)).await;

    t.source.set_available(false);
    let report = t.vault.tick().await;
    assert_eq!(report.failures(), 1);
    match &report.policies[0].outcome {
        TickOutcome::Failed { retryable, .. } => assert!(retryable),
        other => panic!("expected failure, got {:?}", other),
    }

    let failed = t
        .vault
        .audit_events(&AuditQuery::new().event_type(AuditEventType::SnapshotCreated))
        .await;
    assert!(matches!(failed[0].outcome, AuditOutcome::Failed { .. }));

    // Same slot, source back: captured without waiting for the next interval
    t.source.set_available(true);
    t.set_time(std::time::Duration::from_secs(60));
    assert_eq!(t.vault.tick().await.created().len(), 1);
}

#[tokio::test]
async fn test_sweep_marks_expired() {
    let t = TestVault::new().await;
    let policy = t.create_policy("daily", days(1), days(7)).await;
    t.vault.engage_lock(policy.id(), OFFICER).await.unwrap();
    let snapshot = t.vault.create_snapshot(policy.id(), ADMIN).await.unwrap();

    t.set_time(days(6));
    assert!(t.vault.sweep_expired().await.unwrap().expired.is_empty());

    t.set_time(days(7));
    let report = t.vault.sweep_expired().await.unwrap();
    assert_eq!(report.expired, vec![snapshot.id()]);
    assert!(report.purged.is_empty());

    let expired = t.vault.get_snapshot(snapshot.id()).await.unwrap();
    assert_eq!(expired.state(), SnapshotState::Expired);
    t.vault.delete_snapshot(snapshot.id(), ADMIN).await.unwrap();
}

// =============================================================================
// Restore
// =============================================================================

#[tokio::test]
async fn test_restore_locked_snapshot() {
    let t = TestVault::new().await;
    let policy = t.create_policy("daily", days(1), days(30)).await;
    t.vault.engage_lock(policy.id(), OFFICER).await.unwrap();
    let snapshot = t.vault.create_snapshot(policy.id(), ADMIN).await.unwrap();

    // Live data changes after the capture
    t.source.put_object("patients", b"id,name\n".to_vec());

    let result = t
        .vault
        .restore(snapshot.id(), "patients_20240102", RestoreOptions::default(), "analyst")
        .await
        .unwrap();
    assert_eq!(result.objects_restored, 3);

    let restored = t.source.restored("patients_20240102").unwrap();
    assert_eq!(
        restored["patients"],
        b"id,name\n1,Ada Lovelace\n2,Alan Turing\n".to_vec()
    );

    let after = t.vault.get_snapshot(snapshot.id()).await.unwrap();
    assert_eq!(after.content_ref(), snapshot.content_ref());
    assert_eq!(after.expires_at(), snapshot.expires_at());
    assert_eq!(after.state(), SnapshotState::Locked);

    // Restoring over live data needs an explicit overwrite
    let err = t
        .vault
        .restore(snapshot.id(), "patients", RestoreOptions::default(), "analyst")
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 6);
}

#[tokio::test]
async fn test_audit_report_counts() {
    let t = TestVault::new().await;
    let policy = t.create_policy("daily", days(1), days(30)).await;
    t.vault.engage_lock(policy.id(), OFFICER).await.unwrap();
    let snapshot = t.vault.create_snapshot(policy.id(), ADMIN).await.unwrap();
    t.vault.delete_snapshot(snapshot.id(), "root").await.unwrap_err();
    t.vault
        .restore(snapshot.id(), "copy", RestoreOptions::default(), "analyst")
        .await
        .unwrap();

    let report = t.vault.audit_report(at(days(0)), at(days(1))).await;
    assert_eq!(report.locks_engaged, 1);
    assert_eq!(report.rejected_deletions, 1);
    assert_eq!(report.snapshots_deleted, 0);
    assert_eq!(report.restores, 1);
}
