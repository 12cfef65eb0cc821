// Retention policies for scheduled snapshots
//
// A policy is either Unlocked or Locked. The only transition between the two is
// `UnlockedPolicy::lock`, which consumes the unlocked value; there is no
// constructor going the other way.

use crate::config::humantime_serde;
use crate::error::{Result, VaultError};
use crate::types::{DataClassification, PolicyId, TrackedObjectSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DAY: u64 = 24 * 3600;

/// Request to create a retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Unique policy name
    pub name: String,
    /// How often a snapshot is captured
    #[serde(with = "humantime_serde")]
    pub schedule_interval: Duration,
    /// How long each snapshot is retained
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// What the policy captures
    pub tracked: TrackedObjectSet,
    /// Stop scheduling snapshots after this time
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl PolicySpec {
    /// Creates a new policy request
    pub fn new(
        name: impl Into<String>,
        schedule_interval: Duration,
        retention: Duration,
        tracked: TrackedObjectSet,
    ) -> Self {
        Self {
            name: name.into(),
            schedule_interval,
            retention,
            tracked,
            ends_at: None,
        }
    }

    /// Daily capture of PHI retained for six years (HIPAA record retention)
    pub fn hipaa(name: impl Into<String>, tracked: TrackedObjectSet) -> Self {
        Self::new(
            name,
            Duration::from_secs(DAY),
            Duration::from_secs(365 * 6 * DAY),
            tracked.with_classification(DataClassification::Phi),
        )
    }

    /// Sets the end of the schedule
    pub fn with_end(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    /// Validates the request
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(VaultError::InvalidArgument(
                "Policy name cannot be empty".to_string(),
            ));
        }
        if self.schedule_interval.as_millis() == 0 {
            return Err(VaultError::InvalidArgument(
                "Schedule interval must be at least 1ms".to_string(),
            ));
        }
        validate_retention(self.retention)?;
        self.tracked.normalized()?;
        Ok(())
    }
}

/// Checks a retention duration is non-zero and representable as a timestamp offset
pub(crate) fn validate_retention(retention: Duration) -> Result<chrono::Duration> {
    if retention.is_zero() {
        return Err(VaultError::InvalidArgument(
            "Retention duration must be non-zero".to_string(),
        ));
    }
    chrono::Duration::from_std(retention)
        .map_err(|_| VaultError::InvalidArgument(format!("Retention {:?} is too large", retention)))
}

/// Terms shared by both policy states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTerms {
    pub id: PolicyId,
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub schedule_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    pub tracked: TrackedObjectSet,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub ends_at: Option<DateTime<Utc>>,
}

/// A policy whose retention lock has not been engaged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockedPolicy {
    terms: PolicyTerms,
}

impl UnlockedPolicy {
    /// Builds a policy from a validated request
    pub fn create(spec: PolicySpec, created_by: impl Into<String>, now: DateTime<Utc>) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            terms: PolicyTerms {
                id: PolicyId::new(),
                name: spec.name,
                schedule_interval: spec.schedule_interval,
                retention: spec.retention,
                tracked: spec.tracked.normalized()?,
                created_at: now,
                created_by: created_by.into(),
                ends_at: spec.ends_at,
            },
        })
    }

    pub fn terms(&self) -> &PolicyTerms {
        &self.terms
    }

    /// Changes retention for snapshots created from now on
    pub fn set_retention(&mut self, retention: Duration) -> Result<()> {
        validate_retention(retention)?;
        self.terms.retention = retention;
        Ok(())
    }

    /// Engages the retention lock. Consumes the unlocked policy.
    pub fn lock(self, locked_by: impl Into<String>, locked_at: DateTime<Utc>) -> LockedPolicy {
        LockedPolicy {
            terms: self.terms,
            locked_at,
            locked_by: locked_by.into(),
        }
    }
}

/// A policy under an irreversible retention lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedPolicy {
    terms: PolicyTerms,
    locked_at: DateTime<Utc>,
    locked_by: String,
}

impl LockedPolicy {
    pub fn terms(&self) -> &PolicyTerms {
        &self.terms
    }

    pub fn locked_at(&self) -> DateTime<Utc> {
        self.locked_at
    }

    pub fn locked_by(&self) -> &str {
        &self.locked_by
    }
}

/// Retention policy in either lock state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "lock_state", rename_all = "snake_case")]
pub enum RetentionPolicy {
    Unlocked(UnlockedPolicy),
    Locked(LockedPolicy),
}

impl RetentionPolicy {
    pub fn terms(&self) -> &PolicyTerms {
        match self {
            RetentionPolicy::Unlocked(p) => p.terms(),
            RetentionPolicy::Locked(p) => p.terms(),
        }
    }

    pub fn id(&self) -> PolicyId {
        self.terms().id
    }

    pub fn name(&self) -> &str {
        &self.terms().name
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, RetentionPolicy::Locked(_))
    }

    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RetentionPolicy::Unlocked(_) => None,
            RetentionPolicy::Locked(p) => Some(p.locked_at()),
        }
    }

    /// Whether the schedule is still producing snapshots at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.terms().ends_at.map_or(true, |end| now < end)
    }

    /// Interval slot containing `now`: `floor(now / interval)`
    pub fn slot(&self, now: DateTime<Utc>) -> i64 {
        let interval = self.terms().schedule_interval.as_millis().max(1) as i64;
        now.timestamp_millis().div_euclid(interval)
    }

    /// Expiry for a snapshot captured at `created_at`
    pub fn expiry_for(&self, created_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let retention = validate_retention(self.terms().retention)?;
        created_at.checked_add_signed(retention).ok_or_else(|| {
            VaultError::InvalidArgument(format!(
                "Retention of policy {} overflows the calendar",
                self.id()
            ))
        })
    }

    /// Changes retention for future snapshots; rejected once locked
    pub fn set_retention(&mut self, retention: Duration) -> Result<()> {
        match self {
            RetentionPolicy::Unlocked(p) => p.set_retention(retention),
            RetentionPolicy::Locked(p) => Err(VaultError::PolicyLocked(format!(
                "retention of policy {} is fixed since {}",
                p.terms().id,
                p.locked_at()
            ))),
        }
    }

    /// Returns the locked form of this policy
    pub fn engage_lock(&self, locked_by: &str, at: DateTime<Utc>) -> Result<RetentionPolicy> {
        match self {
            RetentionPolicy::Unlocked(p) => Ok(RetentionPolicy::Locked(p.clone().lock(locked_by, at))),
            RetentionPolicy::Locked(p) => Err(VaultError::AlreadyLocked(p.terms().id.to_string())),
        }
    }
}

impl From<UnlockedPolicy> for RetentionPolicy {
    fn from(policy: UnlockedPolicy) -> Self {
        RetentionPolicy::Unlocked(policy)
    }
}
