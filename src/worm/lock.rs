// Retention lock authority
//
// Engages the one-way Unlocked -> Locked transition of a policy and gates
// retention changes behind it. Both run under the policy's mutex, so two
// concurrent callers observe exactly one winner.

use super::audit::{AuditEvent, AuditEventType, AuditLog};
use super::policy::RetentionPolicy;
use super::registry::PolicyRegistry;
use crate::clock::Clock;
use crate::config::humantime_serde::format_duration;
use crate::error::{Result, VaultError};
use crate::types::PolicyId;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Performs lock engagement and guarded policy edits
pub struct RetentionLockAuthority {
    registry: Arc<PolicyRegistry>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl RetentionLockAuthority {
    pub fn new(registry: Arc<PolicyRegistry>, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            audit,
            clock,
        }
    }

    /// Engages the retention lock on a policy
    ///
    /// Returns `AlreadyLocked` if the lock is already engaged. The original
    /// lock time is never touched by a repeated call.
    pub async fn engage_lock(&self, policy_id: PolicyId, actor: &str) -> Result<RetentionPolicy> {
        let mut policy = self.registry.lock_policy(policy_id).await?;
        let now = self.clock.now();

        match policy.engage_lock(actor, now) {
            Ok(locked) => {
                self.registry.store(&locked)?;
                *policy = locked;

                self.audit
                    .append(
                        AuditEvent::new(AuditEventType::LockEngaged, actor, policy_id, now)
                            .with_policy(policy_id),
                    )
                    .await?;

                info!(
                    policy_id = %policy_id,
                    name = %policy.name(),
                    actor = %actor,
                    "Retention lock engaged"
                );
                Ok(policy.clone())
            }
            Err(err @ VaultError::AlreadyLocked(_)) => {
                let locked_at = policy.locked_at().unwrap_or(now);
                self.audit
                    .append(
                        AuditEvent::new(AuditEventType::LockAlreadyEngaged, actor, policy_id, now)
                            .with_policy(policy_id)
                            .rejected(format!("lock engaged at {}", locked_at)),
                    )
                    .await?;

                warn!(
                    policy_id = %policy_id,
                    actor = %actor,
                    locked_at = %locked_at,
                    "Retention lock already engaged"
                );
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Changes the retention of future snapshots; rejected once locked
    pub async fn update_retention(
        &self,
        policy_id: PolicyId,
        retention: Duration,
        actor: &str,
    ) -> Result<RetentionPolicy> {
        let mut policy = self.registry.lock_policy(policy_id).await?;
        let now = self.clock.now();
        let previous = policy.terms().retention;

        let mut updated = policy.clone();
        let metadata = json!({
            "field": "retention",
            "from": format_duration(previous),
            "to": format_duration(retention),
        });

        if let Err(err) = updated.set_retention(retention) {
            self.audit
                .append(
                    AuditEvent::new(AuditEventType::PolicyUpdated, actor, policy_id, now)
                        .with_policy(policy_id)
                        .with_metadata(metadata)
                        .rejected(err.to_string()),
                )
                .await?;
            warn!(policy_id = %policy_id, actor = %actor, error = %err, "Retention change rejected");
            return Err(err);
        }

        self.registry.store(&updated)?;
        *policy = updated;

        self.audit
            .append(
                AuditEvent::new(AuditEventType::PolicyUpdated, actor, policy_id, now)
                    .with_policy(policy_id)
                    .with_metadata(metadata),
            )
            .await?;

        info!(
            policy_id = %policy_id,
            retention = %format_duration(retention),
            actor = %actor,
            "Policy retention updated"
        );
        Ok(policy.clone())
    }
}
