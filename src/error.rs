//! Error types for vaultlock.
//!
//! This module provides a unified error type [`VaultError`] for all vault operations,
//! along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Retention**: lock violations, redundant lock engagement, locked policy edits
//! - **Lookup/Input**: missing policies or snapshots, restore target collisions
//! - **Capture**: the tracked object set could not be read
//! - **Configuration**: invalid settings
//! - **Storage**: IO, serialization and corruption of persisted state
//!
//! # Example
//!
//! ```rust
//! use vaultlock::error::{Result, VaultError};
//!
//! fn target_name(name: &str) -> Result<&str> {
//!     if name.is_empty() {
//!         return Err(VaultError::InvalidArgument("target cannot be empty".into()));
//!     }
//!     Ok(name)
//! }
//!
//! let err = target_name("").unwrap_err();
//! assert_eq!(err.exit_code(), 2);
//! assert!(!err.is_retryable());
//! ```

use chrono::{DateTime, Utc};
use std::io;
use thiserror::Error;

/// Main error type for vault operations.
#[derive(Error, Debug)]
pub enum VaultError {
    // Retention errors
    #[error("Retention lock violation: snapshot {snapshot_id} is locked until {expires_at}")]
    RetentionLockViolation {
        snapshot_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Retention lock already engaged on policy {0}")]
    AlreadyLocked(String),

    #[error("Policy is retention locked: {0}")]
    PolicyLocked(String),

    // Lookup and input errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Restore target already exists: {0}")]
    TargetExists(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Capture errors
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State directory is in use by another process: {0}")]
    StateLocked(String),

    #[error("Data corruption: {0}")]
    DataCorruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Process exit code used by the command-line wrapper.
    pub fn exit_code(&self) -> i32 {
        match self {
            VaultError::InvalidArgument(_)
            | VaultError::Config(_)
            | VaultError::InvalidConfig { .. }
            | VaultError::AlreadyExists(_) => 2,
            VaultError::NotFound(_) => 3,
            VaultError::RetentionLockViolation { .. } => 4,
            VaultError::AlreadyLocked(_) => 5,
            VaultError::TargetExists(_) => 6,
            VaultError::CaptureFailed(_) => 7,
            VaultError::PolicyLocked(_) => 8,
            VaultError::StateLocked(_) => 9,
            _ => 1,
        }
    }

    /// Check if error is retryable.
    ///
    /// Only capture failures qualify: the scheduler retries them on its next tick.
    /// A lock violation is never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::CaptureFailed(_))
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;
