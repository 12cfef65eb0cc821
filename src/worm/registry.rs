// Policy registry
//
// Each policy lives behind its own async mutex. Every mutation of a policy or
// of the snapshots it owns holds that mutex, which is what serializes snapshot
// creation against lock engagement.
//
// Readers never take a policy mutex: they see the last version published by
// `store`, which is called under the mutex whenever a policy changes.

use super::policy::{PolicySpec, RetentionPolicy, UnlockedPolicy};
use crate::error::{Result, VaultError};
use crate::persist::{json_documents, read_json, write_json_atomic};
use crate::types::PolicyId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

/// Shared handle to one policy
pub type PolicyHandle = Arc<Mutex<RetentionPolicy>>;

struct PolicyEntry {
    handle: PolicyHandle,
    /// Last stored version, read without the mutex
    published: RetentionPolicy,
}

impl PolicyEntry {
    fn new(policy: RetentionPolicy) -> Self {
        Self {
            handle: Arc::new(Mutex::new(policy.clone())),
            published: policy,
        }
    }
}

/// Registry of retention policies
pub struct PolicyRegistry {
    policies: RwLock<HashMap<PolicyId, PolicyEntry>>,
    /// One JSON document per policy; `None` keeps policies in memory
    dir: Option<PathBuf>,
}

impl PolicyRegistry {
    /// Creates an in-memory registry
    pub fn in_memory() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Opens a registry persisted under `dir`, loading every stored policy
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut policies = HashMap::new();
        for path in json_documents(&dir)? {
            let policy: RetentionPolicy = read_json(&path)?.ok_or_else(|| {
                VaultError::Storage(format!("policy document vanished: {}", path.display()))
            })?;
            policies.insert(policy.id(), PolicyEntry::new(policy));
        }

        info!(dir = %dir.display(), policies = policies.len(), "Opened policy registry");

        Ok(Self {
            policies: RwLock::new(policies),
            dir: Some(dir),
        })
    }

    /// Creates and stores a new unlocked policy
    pub async fn create(
        &self,
        spec: PolicySpec,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Result<RetentionPolicy> {
        let policy: RetentionPolicy = UnlockedPolicy::create(spec, created_by, now)?.into();

        {
            // Names never change, so the published view is enough to find clashes.
            let mut policies = self.policies.write();
            if policies.values().any(|e| e.published.name() == policy.name()) {
                return Err(VaultError::AlreadyExists(format!(
                    "Policy named '{}' already exists",
                    policy.name()
                )));
            }
            self.persist(&policy)?;
            policies.insert(policy.id(), PolicyEntry::new(policy.clone()));
        }

        info!(
            policy_id = %policy.id(),
            name = %policy.name(),
            created_by = %created_by,
            "Created retention policy"
        );

        Ok(policy)
    }

    fn persist(&self, policy: &RetentionPolicy) -> Result<()> {
        if let Some(dir) = &self.dir {
            write_json_atomic(&dir.join(format!("{}.json", policy.id())), policy)?;
        }
        Ok(())
    }

    /// Persists a changed policy and publishes it to readers.
    ///
    /// Callers hold the policy's mutex.
    pub(crate) fn store(&self, policy: &RetentionPolicy) -> Result<()> {
        self.persist(policy)?;
        if let Some(entry) = self.policies.write().get_mut(&policy.id()) {
            entry.published = policy.clone();
        }
        Ok(())
    }

    /// Shared handle to a policy
    pub async fn handle(&self, policy_id: PolicyId) -> Result<PolicyHandle> {
        self.policies
            .read()
            .get(&policy_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| VaultError::NotFound(format!("Policy {}", policy_id)))
    }

    /// Acquires exclusive access to a policy
    pub async fn lock_policy(&self, policy_id: PolicyId) -> Result<OwnedMutexGuard<RetentionPolicy>> {
        Ok(self.handle(policy_id).await?.lock_owned().await)
    }

    /// Gets a copy of a policy
    pub async fn get(&self, policy_id: PolicyId) -> Result<RetentionPolicy> {
        self.policies
            .read()
            .get(&policy_id)
            .map(|e| e.published.clone())
            .ok_or_else(|| VaultError::NotFound(format!("Policy {}", policy_id)))
    }

    /// Lists all policies, oldest first
    pub async fn list(&self) -> Vec<RetentionPolicy> {
        let mut policies: Vec<RetentionPolicy> = self
            .policies
            .read()
            .values()
            .map(|e| e.published.clone())
            .collect();
        policies.sort_by(|a, b| {
            a.terms()
                .created_at
                .cmp(&b.terms().created_at)
                .then_with(|| a.name().cmp(b.name()))
        });
        policies
    }

    /// Looks a policy up by id or by name
    pub async fn resolve(&self, id_or_name: &str) -> Result<PolicyId> {
        let policies = self.policies.read();
        if let Ok(id) = PolicyId::parse(id_or_name) {
            if policies.contains_key(&id) {
                return Ok(id);
            }
        }
        policies
            .values()
            .find(|e| e.published.name() == id_or_name)
            .map(|e| e.published.id())
            .ok_or_else(|| VaultError::NotFound(format!("Policy {}", id_or_name)))
    }

    /// Number of registered policies
    pub async fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}
