// Directory-backed snapshot store
//
// One JSON document per snapshot, replaced atomically. An in-memory index
// loaded at open serves reads.

use super::{newest_first, Snapshot, SnapshotStore};
use crate::error::Result;
use crate::persist::{json_documents, read_json, write_json_atomic};
use crate::types::{PolicyId, SnapshotId};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

/// Snapshot store keeping records under a directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
    index: RwLock<HashMap<SnapshotId, Snapshot>>,
}

impl FileSnapshotStore {
    /// Opens the store, loading every record in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut index = HashMap::new();
        for path in json_documents(&dir)? {
            if let Some(snapshot) = read_json::<Snapshot>(&path)? {
                index.insert(snapshot.id(), snapshot);
            }
        }

        info!(dir = %dir.display(), snapshots = index.len(), "Opened snapshot store");

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    fn path_for(&self, snapshot_id: SnapshotId) -> PathBuf {
        self.dir.join(format!("{}.json", snapshot_id))
    }
}

#[async_trait::async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut index = self.index.write().await;
        write_json_atomic(&self.path_for(snapshot.id()), snapshot)?;
        index.insert(snapshot.id(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, snapshot_id: SnapshotId) -> Result<Option<Snapshot>> {
        Ok(self.index.read().await.get(&snapshot_id).cloned())
    }

    async fn delete(&self, snapshot_id: SnapshotId) -> Result<()> {
        let mut index = self.index.write().await;
        match fs::remove_file(self.path_for(snapshot_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        index.remove(&snapshot_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Snapshot>> {
        let mut list: Vec<Snapshot> = self.index.read().await.values().cloned().collect();
        newest_first(&mut list);
        Ok(list)
    }

    async fn list_by_policy(&self, policy_id: PolicyId) -> Result<Vec<Snapshot>> {
        let mut list: Vec<Snapshot> = self
            .index
            .read()
            .await
            .values()
            .filter(|s| s.policy_id() == policy_id)
            .cloned()
            .collect();
        newest_first(&mut list);
        Ok(list)
    }
}
