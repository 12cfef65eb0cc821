// WORM (Write Once Read Many) retention
//
// Provides the retention side of the vault:
// - Retention policies with an irreversible lock
// - The authority that engages the lock
// - Append-only audit logging for every lifecycle event

pub mod audit;
pub mod lock;
pub mod policy;
pub mod registry;

pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditOutcome, AuditQuery, AuditReport};
pub use lock::RetentionLockAuthority;
pub use policy::{LockedPolicy, PolicySpec, PolicyTerms, RetentionPolicy, UnlockedPolicy};
pub use registry::{PolicyHandle, PolicyRegistry};
