//! Core type definitions for vaultlock.
//!
//! # Key Types
//!
//! - [`PolicyId`]: Unique identifier for a retention policy (UUID-based)
//! - [`SnapshotId`]: Unique identifier for a snapshot (UUID-based)
//! - [`TrackedObjectSet`]: The named set of objects a policy captures
//! - [`DataClassification`]: Sensitivity label carried by a tracked set
//!
//! # Examples
//!
//! ```rust
//! use vaultlock::types::{DataClassification, SnapshotId, TrackedObjectSet};
//!
//! let id = SnapshotId::new();
//! let parsed = SnapshotId::parse(&id.to_string()).unwrap();
//! assert_eq!(id, parsed);
//!
//! let tracked = TrackedObjectSet::new("clinical", ["patients", "encounters"])
//!     .unwrap()
//!     .with_classification(DataClassification::Phi);
//! assert_eq!(tracked.objects(), &["encounters".to_string(), "patients".to_string()]);
//! ```

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub Uuid);

impl PolicyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a PolicyId from a string representation.
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for PolicyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a SnapshotId from a string representation.
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
            .map_err(|e| VaultError::InvalidArgument(format!("invalid snapshot id '{}': {}", s, e)))
    }
}

/// Sensitivity label of a tracked object set.
///
/// Purely informational: no retention rule depends on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataClassification {
    /// Protected Health Information.
    Phi,
    /// Personally identifiable information.
    Pii,
    #[default]
    Internal,
    Public,
}

impl fmt::Display for DataClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DataClassification::Phi => "PHI",
            DataClassification::Pii => "PII",
            DataClassification::Internal => "INTERNAL",
            DataClassification::Public => "PUBLIC",
        };
        f.write_str(label)
    }
}

impl FromStr for DataClassification {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "phi" => Ok(DataClassification::Phi),
            "pii" => Ok(DataClassification::Pii),
            "internal" => Ok(DataClassification::Internal),
            "public" => Ok(DataClassification::Public),
            other => Err(VaultError::InvalidArgument(format!(
                "unknown classification '{}'",
                other
            ))),
        }
    }
}

/// The set of objects (tables, files) a policy covers.
///
/// Object names are kept sorted and de-duplicated so two sets naming the same
/// objects compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedObjectSet {
    name: String,
    objects: Vec<String>,
    #[serde(default)]
    classification: DataClassification,
}

impl TrackedObjectSet {
    /// Create a tracked set, validating every object name.
    pub fn new<I, S>(name: impl Into<String>, objects: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(VaultError::InvalidArgument(
                "tracked object set name cannot be empty".to_string(),
            ));
        }

        let mut objects: Vec<String> = objects.into_iter().map(Into::into).collect();
        if objects.is_empty() {
            return Err(VaultError::InvalidArgument(format!(
                "tracked object set '{}' has no objects",
                name
            )));
        }
        for object in &objects {
            validate_object_name(object)?;
        }
        objects.sort();
        objects.dedup();

        Ok(Self {
            name,
            objects,
            classification: DataClassification::default(),
        })
    }

    /// Set the classification label.
    pub fn with_classification(mut self, classification: DataClassification) -> Self {
        self.classification = classification;
        self
    }

    /// Re-run validation on a deserialized set, returning the normalized form.
    pub fn normalized(&self) -> Result<Self> {
        Ok(Self::new(self.name.clone(), self.objects.iter().cloned())?
            .with_classification(self.classification))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objects(&self) -> &[String] {
        &self.objects
    }

    pub fn classification(&self) -> DataClassification {
        self.classification
    }
}

/// Validate an object or restore-target name.
///
/// Names may contain `/` to address nested objects but never `..`, empty
/// components or a leading slash, so they cannot escape a data root.
pub fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VaultError::InvalidArgument("object name cannot be empty".to_string()));
    }
    if name.starts_with('/') || name.contains('\\') {
        return Err(VaultError::InvalidArgument(format!(
            "object name must be relative: {}",
            name
        )));
    }
    if name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(VaultError::InvalidArgument(format!(
            "invalid object name: {}",
            name
        )));
    }
    Ok(())
}
