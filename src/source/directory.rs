// Directory-backed data source
//
// Tracked objects are files under a data root. A capture copies them into
// `<content_root>/<ref>/objects/` next to a SHA-256 manifest. Both captures
// and restores are staged in a hidden sibling directory and renamed into
// place, so a failure never leaves a partial copy visible.

use super::{
    calculate_checksum, manifest_digest, CapturedContent, ContentRef, DataSource, ManifestEntry,
    MaterializedObject,
};
use crate::error::{Result, VaultError};
use crate::persist::{read_json, write_json_atomic};
use crate::types::{validate_object_name, TrackedObjectSet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MANIFEST: &str = "manifest.json";
const OBJECTS: &str = "objects";

#[derive(Debug, Serialize, Deserialize)]
struct CaptureManifest {
    tracked_set: String,
    entries: Vec<ManifestEntry>,
    digest: String,
}

/// Data source over a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryDataSource {
    data_root: PathBuf,
    content_root: PathBuf,
}

impl DirectoryDataSource {
    /// Creates a source reading from `data_root` and keeping captures in
    /// `content_root`.
    pub fn new(data_root: impl AsRef<Path>, content_root: impl AsRef<Path>) -> Result<Self> {
        let data_root = data_root.as_ref().to_path_buf();
        let content_root = content_root.as_ref().to_path_buf();
        fs::create_dir_all(&data_root)?;
        fs::create_dir_all(&content_root)?;
        Ok(Self {
            data_root,
            content_root,
        })
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    fn content_dir(&self, content: &ContentRef) -> Result<PathBuf> {
        let name = content.as_str();
        validate_object_name(name)?;
        if name.contains('/') {
            return Err(VaultError::InvalidArgument(format!("invalid content ref: {}", name)));
        }
        Ok(self.content_root.join(name))
    }

    fn capture_blocking(&self, tracked: &TrackedObjectSet) -> Result<CapturedContent> {
        let content_ref = ContentRef::generate();
        let staging = self.content_root.join(format!(".staging-{}", content_ref));

        let result = (|| -> Result<CapturedContent> {
            let mut entries = Vec::with_capacity(tracked.objects().len());
            for name in tracked.objects() {
                let source = self.data_root.join(name);
                let data = fs::read(&source).map_err(|e| {
                    VaultError::CaptureFailed(format!("cannot read '{}': {}", name, e))
                })?;

                let dest = staging.join(OBJECTS).join(name);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&dest, &data)?;

                entries.push(ManifestEntry {
                    name: name.clone(),
                    size: data.len() as u64,
                    checksum: calculate_checksum(&data),
                });
            }

            let manifest = CaptureManifest {
                tracked_set: tracked.name().to_string(),
                digest: manifest_digest(&entries),
                entries,
            };
            write_json_atomic(&staging.join(MANIFEST), &manifest)?;
            fs::rename(&staging, self.content_dir(&content_ref)?)?;

            Ok(CapturedContent {
                content_ref: content_ref.clone(),
                digest: manifest.digest,
                object_count: manifest.entries.len() as u64,
                total_bytes: manifest.entries.iter().map(|e| e.size).sum(),
            })
        })();

        if result.is_err() {
            remove_dir_if_present(&staging);
        }
        result
    }

    fn materialize_blocking(
        &self,
        content: &ContentRef,
        digest: &str,
        target: &str,
        overwrite: bool,
    ) -> Result<MaterializedObject> {
        validate_object_name(target)?;
        let dir = self.content_dir(content)?;
        let manifest: CaptureManifest = read_json(&dir.join(MANIFEST))?
            .ok_or_else(|| VaultError::NotFound(format!("Captured content {}", content)))?;

        if manifest.digest != digest || manifest_digest(&manifest.entries) != digest {
            return Err(VaultError::DataCorruption(format!(
                "manifest of {} does not match the snapshot digest",
                content
            )));
        }

        let dest = self.data_root.join(target);
        if dest.exists() && !overwrite {
            return Err(VaultError::TargetExists(target.to_string()));
        }

        let staging = self.data_root.join(format!(".restore-{}", uuid::Uuid::new_v4()));
        let result = (|| -> Result<MaterializedObject> {
            for entry in &manifest.entries {
                let data = fs::read(dir.join(OBJECTS).join(&entry.name))?;
                if calculate_checksum(&data) != entry.checksum {
                    return Err(VaultError::DataCorruption(format!(
                        "object '{}' of {} failed checksum verification",
                        entry.name, content
                    )));
                }

                let out = staging.join(&entry.name);
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&out, &data)?;
            }
            fs::create_dir_all(&staging)?;

            if dest.exists() {
                if !overwrite {
                    return Err(VaultError::TargetExists(target.to_string()));
                }
                if dest.is_dir() {
                    fs::remove_dir_all(&dest)?;
                } else {
                    fs::remove_file(&dest)?;
                }
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&staging, &dest)?;

            Ok(MaterializedObject {
                target: target.to_string(),
                location: dest.display().to_string(),
                objects_restored: manifest.entries.len() as u64,
                bytes_restored: manifest.entries.iter().map(|e| e.size).sum(),
            })
        })();

        if result.is_err() {
            remove_dir_if_present(&staging);
        }
        result
    }
}

fn remove_dir_if_present(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging directory"),
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::Internal(format!("blocking task failed: {}", e)))?
}

#[async_trait::async_trait]
impl DataSource for DirectoryDataSource {
    fn kind(&self) -> &'static str {
        "directory"
    }

    async fn capture(&self, tracked: &TrackedObjectSet) -> Result<CapturedContent> {
        let this = self.clone();
        let tracked = tracked.clone();
        let captured = blocking(move || this.capture_blocking(&tracked)).await?;
        debug!(
            content = %captured.content_ref,
            objects = captured.object_count,
            bytes = captured.total_bytes,
            "Captured tracked objects from directory"
        );
        Ok(captured)
    }

    async fn target_exists(&self, target: &str) -> Result<bool> {
        validate_object_name(target)?;
        Ok(self.data_root.join(target).exists())
    }

    async fn materialize(
        &self,
        content: &ContentRef,
        digest: &str,
        target: &str,
        overwrite: bool,
    ) -> Result<MaterializedObject> {
        let this = self.clone();
        let content = content.clone();
        let digest = digest.to_string();
        let target = target.to_string();
        blocking(move || this.materialize_blocking(&content, &digest, &target, overwrite)).await
    }

    async fn discard(&self, content: &ContentRef) -> Result<()> {
        let dir = self.content_dir(content)?;
        blocking(move || match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }
}
