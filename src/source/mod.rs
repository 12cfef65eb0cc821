//! Data sources that snapshots capture from and restore into.
//!
//! A [`DataSource`] owns both the live objects named by a policy's tracked
//! set and the captured copies that back snapshots. Captures are
//! all-or-nothing: either every tracked object is copied and a
//! [`ContentRef`] is returned, or nothing is left behind.

mod directory;

pub use directory::DirectoryDataSource;

use crate::error::{Result, VaultError};
use crate::types::{validate_object_name, TrackedObjectSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Opaque reference to captured data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(pub String);

impl ContentRef {
    /// Fresh reference for a new capture.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of capturing a tracked object set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedContent {
    /// Where the captured copy lives.
    pub content_ref: ContentRef,
    /// SHA-256 over the capture manifest.
    pub digest: String,
    /// Number of objects captured.
    pub object_count: u64,
    /// Total captured bytes.
    pub total_bytes: u64,
}

/// A restored, writable copy of captured data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedObject {
    /// Target name the copy was restored to.
    pub target: String,
    /// Backend-specific location of the copy.
    pub location: String,
    /// Objects written.
    pub objects_restored: u64,
    /// Bytes written.
    pub bytes_restored: u64,
}

/// One captured object in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    pub checksum: String,
}

/// Backend for capture and restore.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// Short backend name used in logs.
    fn kind(&self) -> &'static str;

    /// Capture every object of `tracked`. Fails with `CaptureFailed` and
    /// leaves nothing behind if any object cannot be read.
    async fn capture(&self, tracked: &TrackedObjectSet) -> Result<CapturedContent>;

    /// Whether `target` names a live object.
    async fn target_exists(&self, target: &str) -> Result<bool>;

    /// Write an independent copy of captured content to `target`,
    /// verifying it against `digest` first.
    async fn materialize(
        &self,
        content: &ContentRef,
        digest: &str,
        target: &str,
        overwrite: bool,
    ) -> Result<MaterializedObject>;

    /// Drop captured content. Unknown references are ignored.
    async fn discard(&self, content: &ContentRef) -> Result<()>;
}

/// SHA-256 of a byte slice, lowercase hex.
pub(crate) fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Digest over a manifest; entries must be sorted by name.
pub(crate) fn manifest_digest(entries: &[ManifestEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.size.to_le_bytes());
        hasher.update(entry.checksum.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

fn manifest_of(objects: &BTreeMap<String, Vec<u8>>) -> Vec<ManifestEntry> {
    objects
        .iter()
        .map(|(name, data)| ManifestEntry {
            name: name.clone(),
            size: data.len() as u64,
            checksum: calculate_checksum(data),
        })
        .collect()
}

/// In-memory data source.
///
/// Live objects are set with [`put_object`](Self::put_object); restored
/// copies are kept per target and can be inspected with
/// [`restored`](Self::restored).
pub struct MemoryDataSource {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    captures: RwLock<HashMap<ContentRef, BTreeMap<String, Vec<u8>>>>,
    restored: RwLock<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    available: AtomicBool,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            captures: RwLock::new(HashMap::new()),
            restored: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Sets a live object's contents.
    pub fn put_object(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects.write().insert(name.into(), data.into());
    }

    /// Removes a live object.
    pub fn remove_object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.write().remove(name)
    }

    /// Marks the source unavailable so captures fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Objects restored to `target`.
    pub fn restored(&self, target: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.restored.read().get(target).cloned()
    }

    /// Number of captures currently held.
    pub fn capture_count(&self) -> usize {
        self.captures.read().len()
    }

    /// Overwrites captured bytes in place. Test hook for digest checks.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, content: &ContentRef, object: &str) {
        if let Some(data) = self
            .captures
            .write()
            .get_mut(content)
            .and_then(|c| c.get_mut(object))
        {
            data.push(0xff);
        }
    }
}

impl Default for MemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DataSource for MemoryDataSource {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn capture(&self, tracked: &TrackedObjectSet) -> Result<CapturedContent> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(VaultError::CaptureFailed(format!(
                "data source unavailable while capturing '{}'",
                tracked.name()
            )));
        }

        let copy = {
            let objects = self.objects.read();
            let mut copy = BTreeMap::new();
            for name in tracked.objects() {
                let data = objects.get(name).ok_or_else(|| {
                    VaultError::CaptureFailed(format!("object '{}' does not exist", name))
                })?;
                copy.insert(name.clone(), data.clone());
            }
            copy
        };

        let manifest = manifest_of(&copy);
        let captured = CapturedContent {
            content_ref: ContentRef::generate(),
            digest: manifest_digest(&manifest),
            object_count: manifest.len() as u64,
            total_bytes: manifest.iter().map(|e| e.size).sum(),
        };

        self.captures.write().insert(captured.content_ref.clone(), copy);
        debug!(content = %captured.content_ref, objects = captured.object_count, "Captured in memory");
        Ok(captured)
    }

    async fn target_exists(&self, target: &str) -> Result<bool> {
        Ok(self.restored.read().contains_key(target) || self.objects.read().contains_key(target))
    }

    async fn materialize(
        &self,
        content: &ContentRef,
        digest: &str,
        target: &str,
        overwrite: bool,
    ) -> Result<MaterializedObject> {
        validate_object_name(target)?;

        let copy = self
            .captures
            .read()
            .get(content)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("Captured content {}", content)))?;

        let manifest = manifest_of(&copy);
        if manifest_digest(&manifest) != digest {
            return Err(VaultError::DataCorruption(format!(
                "captured content {} does not match its digest",
                content
            )));
        }

        let mut restored = self.restored.write();
        if !overwrite && (restored.contains_key(target) || self.objects.read().contains_key(target)) {
            return Err(VaultError::TargetExists(target.to_string()));
        }

        let materialized = MaterializedObject {
            target: target.to_string(),
            location: format!("memory://{}", target),
            objects_restored: manifest.len() as u64,
            bytes_restored: manifest.iter().map(|e| e.size).sum(),
        };
        restored.insert(target.to_string(), copy);
        Ok(materialized)
    }

    async fn discard(&self, content: &ContentRef) -> Result<()> {
        self.captures.write().remove(content);
        Ok(())
    }
}
