//! Point-in-time snapshots of tracked object sets.
//!
//! A [`Snapshot`] is immutable apart from its ACTIVE/LOCKED -> EXPIRED
//! transition. Whether it may be deleted is decided by
//! [`Snapshot::check_deletable`], a pure function of the snapshot and the
//! current time; the caller's identity never enters into it.

mod file;
mod manager;

pub use file::FileSnapshotStore;
pub use manager::{SnapshotManager, SweepReport, SYSTEM_ACTOR};

use crate::error::{Result, VaultError};
use crate::source::{CapturedContent, ContentRef};
use crate::types::{PolicyId, SnapshotId};
use crate::worm::RetentionPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Snapshot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    /// Deletable at any time.
    Active,
    /// Undeletable until its expiry.
    Locked,
    /// Past its expiry; may be purged.
    Expired,
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SnapshotState::Active => "ACTIVE",
            SnapshotState::Locked => "LOCKED",
            SnapshotState::Expired => "EXPIRED",
        };
        f.write_str(label)
    }
}

/// A point-in-time snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique snapshot ID.
    id: SnapshotId,
    /// Policy that produced the snapshot.
    policy_id: PolicyId,
    /// Policy name at creation.
    policy_name: String,
    /// When the snapshot was captured.
    created_at: DateTime<Utc>,
    /// Fixed at creation; never shortened.
    expires_at: DateTime<Utc>,
    /// Captured data.
    content_ref: ContentRef,
    /// Digest of the captured data.
    digest: String,
    /// Number of objects captured.
    object_count: u64,
    /// Total captured bytes.
    total_bytes: u64,
    /// Who triggered the capture.
    created_by: String,
    /// Born under an engaged retention lock.
    retention_locked: bool,
    /// Current state.
    state: SnapshotState,
}

impl Snapshot {
    /// Builds a snapshot of captured content under `policy`.
    ///
    /// The state is LOCKED exactly when the policy is locked at this point.
    pub fn new(
        policy: &RetentionPolicy,
        captured: CapturedContent,
        created_by: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let retention_locked = policy.is_locked();
        Ok(Self {
            id: SnapshotId::new(),
            policy_id: policy.id(),
            policy_name: policy.name().to_string(),
            created_at,
            expires_at: policy.expiry_for(created_at)?,
            content_ref: captured.content_ref,
            digest: captured.digest,
            object_count: captured.object_count,
            total_bytes: captured.total_bytes,
            created_by: created_by.into(),
            retention_locked,
            state: if retention_locked {
                SnapshotState::Locked
            } else {
                SnapshotState::Active
            },
        })
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn policy_id(&self) -> PolicyId {
        self.policy_id
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn content_ref(&self) -> &ContentRef {
        &self.content_ref
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn object_count(&self) -> u64 {
        self.object_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn retention_locked(&self) -> bool {
        self.retention_locked
    }

    /// Recorded state.
    pub fn state(&self) -> SnapshotState {
        self.state
    }

    /// State as of `now`, counting a passed expiry as EXPIRED before a sweep records it.
    pub fn effective_state(&self, now: DateTime<Utc>) -> SnapshotState {
        if self.is_past_expiry(now) {
            SnapshotState::Expired
        } else {
            self.state
        }
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Checks whether the snapshot may be deleted at `now`.
    pub fn check_deletable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.retention_locked && !self.is_past_expiry(now) {
            return Err(VaultError::RetentionLockViolation {
                snapshot_id: self.id.to_string(),
                expires_at: self.expires_at,
            });
        }
        Ok(())
    }

    /// Records the EXPIRED state. Returns false if not yet expired or already marked.
    pub(crate) fn mark_expired(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == SnapshotState::Expired || !self.is_past_expiry(now) {
            return false;
        }
        self.state = SnapshotState::Expired;
        true
    }
}

/// Trait for snapshot storage backend.
///
/// Listings are ordered newest first.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot, replacing any previous version.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Load a snapshot by ID.
    async fn load(&self, snapshot_id: SnapshotId) -> Result<Option<Snapshot>>;

    /// Delete a snapshot record.
    async fn delete(&self, snapshot_id: SnapshotId) -> Result<()>;

    /// List all snapshots.
    async fn list(&self) -> Result<Vec<Snapshot>>;

    /// List snapshots of one policy.
    async fn list_by_policy(&self, policy_id: PolicyId) -> Result<Vec<Snapshot>>;
}

pub(crate) fn newest_first(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// In-memory snapshot store.
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<SnapshotId, Snapshot>>,
}

impl MemorySnapshotStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, snapshot_id: SnapshotId) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&snapshot_id).cloned())
    }

    async fn delete(&self, snapshot_id: SnapshotId) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(&snapshot_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        let mut list: Vec<Snapshot> = snapshots.values().cloned().collect();
        newest_first(&mut list);
        Ok(list)
    }

    async fn list_by_policy(&self, policy_id: PolicyId) -> Result<Vec<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        let mut list: Vec<Snapshot> = snapshots
            .values()
            .filter(|s| s.policy_id == policy_id)
            .cloned()
            .collect();
        newest_first(&mut list);
        Ok(list)
    }
}
