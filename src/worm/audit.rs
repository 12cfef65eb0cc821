// Append-only audit log of lifecycle events
//
// Events are totally ordered by (timestamp, sequence). The log exposes no
// update or delete operation.

use crate::error::{Result, VaultError};
use crate::types::PolicyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Audit event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    // Policy events
    PolicyCreated,
    PolicyUpdated,
    LockEngaged,
    LockAlreadyEngaged,

    // Snapshot events
    SnapshotCreated,
    SnapshotExpired,
    DeleteAttempted,
    DeleteRejected,
    SnapshotDeleted,

    // Restore events
    RestorePerformed,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 10] = [
        AuditEventType::PolicyCreated,
        AuditEventType::PolicyUpdated,
        AuditEventType::LockEngaged,
        AuditEventType::LockAlreadyEngaged,
        AuditEventType::SnapshotCreated,
        AuditEventType::SnapshotExpired,
        AuditEventType::DeleteAttempted,
        AuditEventType::DeleteRejected,
        AuditEventType::SnapshotDeleted,
        AuditEventType::RestorePerformed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::PolicyCreated => "POLICY_CREATED",
            AuditEventType::PolicyUpdated => "POLICY_UPDATED",
            AuditEventType::LockEngaged => "LOCK_ENGAGED",
            AuditEventType::LockAlreadyEngaged => "LOCK_ALREADY_ENGAGED",
            AuditEventType::SnapshotCreated => "SNAPSHOT_CREATED",
            AuditEventType::SnapshotExpired => "SNAPSHOT_EXPIRED",
            AuditEventType::DeleteAttempted => "DELETE_ATTEMPTED",
            AuditEventType::DeleteRejected => "DELETE_REJECTED",
            AuditEventType::SnapshotDeleted => "SNAPSHOT_DELETED",
            AuditEventType::RestorePerformed => "RESTORE_PERFORMED",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().replace('-', "_").to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| VaultError::InvalidArgument(format!("unknown audit event type '{}'", s)))
    }
}

/// Result of the audited action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    /// The request was refused (lock violation, missing target, ...)
    Rejected { reason: String },
    /// The request was accepted but could not be carried out
    Failed { reason: String },
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Success)
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => f.write_str("SUCCESS"),
            AuditOutcome::Rejected { reason } => write!(f, "REJECTED: {}", reason),
            AuditOutcome::Failed { reason } => write!(f, "FAILED: {}", reason),
        }
    }
}

/// Audit event details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditDetails {
    /// Policy the subject belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    /// Snapshot expiry at the time of the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Restore target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Correlates the events written for one request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    /// Custom metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: Uuid,
    /// Position in the log; assigned on append
    pub sequence: u64,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Who performed the action
    pub actor: String,
    /// Event type
    pub event_type: AuditEventType,
    /// Policy or snapshot the event is about
    pub subject_id: String,
    /// Action result
    pub outcome: AuditOutcome,
    /// Additional details
    #[serde(default)]
    pub details: AuditDetails,
}

impl AuditEvent {
    /// Creates a new successful audit event
    pub fn new(
        event_type: AuditEventType,
        actor: impl Into<String>,
        subject_id: impl ToString,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp,
            actor: actor.into(),
            event_type,
            subject_id: subject_id.to_string(),
            outcome: AuditOutcome::Success,
            details: AuditDetails::default(),
        }
    }

    /// Marks as rejected
    pub fn rejected(mut self, reason: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Rejected {
            reason: reason.into(),
        };
        self
    }

    /// Marks as failed
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failed {
            reason: reason.into(),
        };
        self
    }

    pub fn with_policy(mut self, policy_id: PolicyId) -> Self {
        self.details.policy_id = Some(policy_id);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.details.expires_at = Some(expires_at);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.details.target = Some(target.into());
        self
    }

    pub fn with_request(mut self, request_id: Uuid) -> Self {
        self.details.request_id = Some(request_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.details.metadata = Some(metadata);
        self
    }

    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}

/// Audit query filters
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_types: Option<Vec<AuditEventType>>,
    pub actor: Option<String>,
    pub subject_id: Option<String>,
    pub request_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_types.get_or_insert_with(Vec::new).push(event_type);
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn subject(mut self, subject_id: impl ToString) -> Self {
        self.subject_id = Some(subject_id.to_string());
        self
    }

    pub fn request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, e: &AuditEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.contains(&e.event_type) {
                return false;
            }
        }
        if let Some(ref actor) = self.actor {
            if &e.actor != actor {
                return false;
            }
        }
        if let Some(ref subject) = self.subject_id {
            if &e.subject_id != subject {
                return false;
            }
        }
        if let Some(request_id) = self.request_id {
            if e.details.request_id != Some(request_id) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if e.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if e.timestamp > to {
                return false;
            }
        }
        true
    }
}

struct AuditState {
    events: Vec<AuditEvent>,
    next_sequence: u64,
    file: Option<File>,
}

/// Append-only audit log
pub struct AuditLog {
    state: RwLock<AuditState>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Creates an in-memory audit log
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(AuditState {
                events: Vec::new(),
                next_sequence: 1,
                file: None,
            }),
            path: None,
        }
    }

    /// Opens (or creates) a JSON-lines audit log, reloading existing events
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut events: Vec<AuditEvent> = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let event: AuditEvent = serde_json::from_str(&line).map_err(|e| {
                    VaultError::DataCorruption(format!(
                        "audit log {} line {}: {}",
                        path.display(),
                        lineno + 1,
                        e
                    ))
                })?;
                if let Some(prev) = events.last() {
                    if event.sequence <= prev.sequence {
                        return Err(VaultError::DataCorruption(format!(
                            "audit log {} line {}: sequence {} does not follow {}",
                            path.display(),
                            lineno + 1,
                            event.sequence,
                            prev.sequence
                        )));
                    }
                }
                events.push(event);
            }
        }

        let next_sequence = events.last().map_or(1, |e| e.sequence + 1);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        info!(path = %path.display(), events = events.len(), "Opened audit log");

        Ok(Self {
            state: RwLock::new(AuditState {
                events,
                next_sequence,
                file: Some(file),
            }),
            path: Some(path),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends an event, assigning its sequence number
    ///
    /// The event is written to the backing file before it becomes visible to
    /// readers; if the write fails nothing is appended.
    pub async fn append(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        let mut state = self.state.write().await;
        event.sequence = state.next_sequence;

        if let Some(file) = state.file.as_mut() {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            file.write_all(&line)?;
            file.flush()?;
        }

        debug!(
            sequence = event.sequence,
            event_type = %event.event_type,
            subject = %event.subject_id,
            "Audit event appended"
        );

        state.next_sequence += 1;
        state.events.push(event.clone());
        Ok(event)
    }

    /// Queries audit events in (timestamp, sequence) order
    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let state = self.state.read().await;

        let mut events: Vec<AuditEvent> = state
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.order_key());

        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        events
    }

    /// Every event, in order
    pub async fn all(&self) -> Vec<AuditEvent> {
        self.query(&AuditQuery::new()).await
    }

    /// Gets events about one policy or snapshot
    pub async fn history(&self, subject_id: impl ToString) -> Vec<AuditEvent> {
        self.query(&AuditQuery::new().subject(subject_id)).await
    }

    /// Gets event count
    pub async fn count(&self) -> usize {
        self.state.read().await.events.len()
    }

    /// Exports events to JSON
    pub async fn export_json(&self, query: &AuditQuery) -> Result<String> {
        let events = self.query(query).await;
        Ok(serde_json::to_string_pretty(&events)?)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Summary of audit activity over a period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_events: u64,
    pub events_by_type: BTreeMap<AuditEventType, u64>,
    pub rejected_deletions: u64,
    pub snapshots_deleted: u64,
    pub restores: u64,
    pub locks_engaged: u64,
    pub unique_actors: u64,
    pub unique_subjects: u64,
}

impl AuditReport {
    /// Generates a report from audit events
    pub async fn generate(
        log: &AuditLog,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let events = log.query(&AuditQuery::new().from(from).to(to)).await;

        let mut events_by_type = BTreeMap::new();
        let mut actors = HashSet::new();
        let mut subjects = HashSet::new();

        for event in &events {
            *events_by_type.entry(event.event_type).or_insert(0) += 1;
            actors.insert(event.actor.as_str());
            subjects.insert(event.subject_id.as_str());
        }

        let count = |t: AuditEventType| events_by_type.get(&t).copied().unwrap_or(0);
        let restores = events
            .iter()
            .filter(|e| e.event_type == AuditEventType::RestorePerformed && e.outcome.is_success())
            .count() as u64;

        Self {
            generated_at,
            period_start: from,
            period_end: to,
            total_events: events.len() as u64,
            rejected_deletions: count(AuditEventType::DeleteRejected),
            snapshots_deleted: count(AuditEventType::SnapshotDeleted),
            restores,
            locks_engaged: count(AuditEventType::LockEngaged),
            unique_actors: actors.len() as u64,
            unique_subjects: subjects.len() as u64,
            events_by_type,
        }
    }
}
