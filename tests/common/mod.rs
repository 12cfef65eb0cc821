//! Common test utilities for integration tests.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vaultlock::clock::ManualClock;
use vaultlock::config::VaultConfig;
use vaultlock::source::MemoryDataSource;
use vaultlock::types::{DataClassification, TrackedObjectSet};
use vaultlock::worm::{PolicySpec, RetentionPolicy};
use vaultlock::Vault;

pub const ADMIN: &str = "admin";
pub const OFFICER: &str = "compliance-officer";

pub fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 3600)
}

pub fn days(n: u64) -> Duration {
    Duration::from_secs(n * 86_400)
}

/// `offset` after the Unix epoch, where every [`TestVault`] clock starts.
pub fn at(offset: Duration) -> DateTime<Utc> {
    DateTime::<Utc>::default() + chrono::Duration::from_std(offset).unwrap()
}

/// Test environment that manages a temporary state directory.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let state_dir = temp_dir.path().join("state");
        let data_dir = temp_dir.path().join("data");
        std::fs::create_dir_all(&data_dir).expect("Failed to create data dir");

        Self {
            temp_dir,
            state_dir,
            data_dir,
        }
    }

    /// Config with durable state in this environment.
    pub fn config(&self) -> VaultConfig {
        VaultConfig::default().with_state_dir(&self.state_dir)
    }

    /// Writes a tracked object under the data directory.
    pub fn write_object(&self, name: &str, content: &[u8]) {
        let path = self.data_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create object dir");
        }
        std::fs::write(path, content).expect("Failed to write object");
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A vault on a manual clock over an in-memory clinical data set.
pub struct TestVault {
    pub vault: Vault,
    pub clock: Arc<ManualClock>,
    pub source: Arc<MemoryDataSource>,
}

impl TestVault {
    pub async fn new() -> Self {
        Self::with_config(VaultConfig::default()).await
    }

    pub async fn with_config(config: VaultConfig) -> Self {
        let clock = Arc::new(ManualClock::at_epoch());
        let source = Arc::new(clinical_source());
        let vault = Vault::open_with(config, clock.clone(), source.clone())
            .await
            .expect("Failed to open vault");
        Self {
            vault,
            clock,
            source,
        }
    }

    /// Moves the clock to `offset` after the epoch.
    pub fn set_time(&self, offset: Duration) {
        self.clock.set(at(offset));
    }

    pub async fn create_policy(
        &self,
        name: &str,
        interval: Duration,
        retention: Duration,
    ) -> RetentionPolicy {
        self.vault
            .create_policy(PolicySpec::new(name, interval, retention, clinical_set()), ADMIN)
            .await
            .expect("Failed to create policy")
    }
}

pub fn clinical_set() -> TrackedObjectSet {
    TrackedObjectSet::new("clinical", ["patients", "encounters", "prescriptions"])
        .expect("valid tracked set")
        .with_classification(DataClassification::Phi)
}

pub fn clinical_source() -> MemoryDataSource {
    let source = MemoryDataSource::new();
    source.put_object("patients", b"id,name\n1,Ada Lovelace\n2,Alan Turing\n".to_vec());
    source.put_object("encounters", b"id,patient,date\n9,1,2024-01-02\n".to_vec());
    source.put_object("prescriptions", b"id,patient,drug\n4,2,amoxicillin\n".to_vec());
    source
}
