//! Configuration module for vaultlock.

use crate::error::{Result, VaultError};
use crate::worm::PolicySpec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a vault.
///
/// Passed explicitly to [`crate::Vault::open`]; nothing in the crate reads
/// process-wide settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Policies created on open if no policy with the same name exists.
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

impl VaultConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VaultError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            VaultError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval.is_zero() {
            return Err(VaultError::InvalidConfig {
                field: "scheduler.tick_interval".to_string(),
                reason: "Tick interval must be non-zero".to_string(),
            });
        }

        if self.scheduler.purge_expired && !self.scheduler.sweep_expired {
            return Err(VaultError::InvalidConfig {
                field: "scheduler.purge_expired".to_string(),
                reason: "Purging requires sweep_expired".to_string(),
            });
        }

        if self.storage.data_dir.is_some() && self.storage.state_dir.is_none() {
            return Err(VaultError::InvalidConfig {
                field: "storage.data_dir".to_string(),
                reason: "A directory data source needs storage.state_dir for captured content"
                    .to_string(),
            });
        }

        let mut names = HashSet::new();
        for (i, spec) in self.policies.iter().enumerate() {
            spec.validate().map_err(|e| VaultError::InvalidConfig {
                field: format!("policies[{}]", i),
                reason: e.to_string(),
            })?;
            if !names.insert(spec.name.as_str()) {
                return Err(VaultError::InvalidConfig {
                    field: format!("policies[{}].name", i),
                    reason: format!("Duplicate policy name '{}'", spec.name),
                });
            }
        }

        Ok(())
    }

    /// Create an in-memory development configuration.
    pub fn development() -> Self {
        Self {
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig {
                enabled: true,
                tick_interval: Duration::from_secs(1),
                sweep_expired: true,
                purge_expired: false,
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
            },
            policies: Vec::new(),
        }
    }

    /// Use `dir` for durable policies, snapshots and audit log.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.state_dir = Some(dir.into());
        self
    }

    /// Use `dir` as the root of the directory data source.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = Some(dir.into());
        self
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding policies, snapshots and the audit log.
    /// `None` keeps everything in memory.
    pub state_dir: Option<PathBuf>,
    /// Root directory of tracked objects. `None` uses an in-memory source.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn policies_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("policies"))
    }

    pub fn snapshots_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("snapshots"))
    }

    pub fn audit_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("audit.jsonl"))
    }

    pub fn content_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("content"))
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run the background scheduler in `serve` mode.
    pub enabled: bool,
    /// How often the scheduler wakes up to check policy slots.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Mark snapshots past expiry as expired on every tick.
    pub sweep_expired: bool,
    /// Delete snapshots once they are expired.
    pub purge_expired: bool,
}

impl SchedulerConfig {
    /// Turns on purging, and the sweep it depends on.
    pub fn enable_purge(&mut self) {
        self.sweep_expired = true;
        self.purge_expired = true;
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(60),
            sweep_expired: true,
            purge_expired: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Render a duration in the largest unit that represents it exactly.
    pub fn format_duration(duration: Duration) -> String {
        let ms = duration.as_millis();
        if ms == 0 {
            return "0s".to_string();
        }
        if ms % 1000 != 0 {
            return format!("{}ms", ms);
        }
        let secs = duration.as_secs();
        if secs % 86_400 == 0 {
            format!("{}d", secs / 86_400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parse `500ms`, `30s`, `15m`, `6h`, `90d`; a bare number is milliseconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let secs = |v: &str, mult: u64| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{}': {}", s, e))
                .and_then(|v| {
                    v.checked_mul(mult)
                        .map(Duration::from_secs)
                        .ok_or_else(|| format!("duration '{}' is too large", s))
                })
        };

        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{}': {}", s, e))
        } else if let Some(v) = s.strip_suffix('s') {
            secs(v, 1)
        } else if let Some(v) = s.strip_suffix('m') {
            secs(v, 60)
        } else if let Some(v) = s.strip_suffix('h') {
            secs(v, 3600)
        } else if let Some(v) = s.strip_suffix('d') {
            secs(v, 86_400)
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{}': {}", s, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::humantime_serde::{format_duration, parse_duration};
    use super::*;
    use crate::types::TrackedObjectSet;

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert!(config.storage.state_dir.is_none());
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = VaultConfig::development().with_state_dir("/tmp/vault");
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(
            config.storage.audit_path(),
            Some(PathBuf::from("/tmp/vault/audit.jsonl"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(6 * 3600));
        assert_eq!(parse_duration("90d").unwrap(), Duration::from_secs(90 * 86_400));
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("six hours").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration_largest_unit() {
        assert_eq!(format_duration(Duration::from_secs(90 * 86_400)), "90d");
        assert_eq!(format_duration(Duration::from_secs(6 * 3600)), "6h");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let mut config = VaultConfig::default();
        config.scheduler.tick_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(VaultError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_policy_names() {
        let tracked = TrackedObjectSet::new("clinical", ["patients"]).unwrap();
        let mut config = VaultConfig::default();
        config.policies.push(PolicySpec::hipaa("daily", tracked.clone()));
        config.policies.push(PolicySpec::hipaa("daily", tracked));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate policy name"));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "scheduler": { "enabled": true, "tick_interval": "30s", "sweep_expired": true, "purge_expired": true },
            "policies": [{
                "name": "clinical-6h",
                "schedule_interval": "6h",
                "retention": "90d",
                "tracked": { "name": "clinical", "objects": ["patients", "encounters"], "classification": "PHI" }
            }]
        }"#;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        std::fs::write(&path, json).unwrap();

        let config = VaultConfig::from_file(&path).unwrap();
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(30));
        assert!(config.scheduler.purge_expired);
        assert_eq!(config.policies.len(), 1);
        assert_eq!(config.policies[0].retention, Duration::from_secs(90 * 86_400));
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_data_dir_needs_state_dir() {
        let config = VaultConfig::default().with_data_dir("/srv/data");
        assert!(matches!(
            config.validate(),
            Err(VaultError::InvalidConfig { .. })
        ));
        assert!(config.with_state_dir("/srv/state").validate().is_ok());
    }

    #[test]
    fn test_enable_purge_turns_on_sweep() {
        let mut config = VaultConfig::default();
        config.scheduler.sweep_expired = false;

        config.scheduler.enable_purge();
        assert!(config.scheduler.sweep_expired);
        assert!(config.scheduler.purge_expired);
        assert!(config.validate().is_ok());
    }
}
