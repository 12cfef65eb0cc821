//! Command-line interface for vaultlock.

pub mod output;

use crate::config::humantime_serde::parse_duration;
use crate::types::{DataClassification, SnapshotId};
use crate::worm::AuditEventType;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use output::OutputFormat;
use std::path::PathBuf;
use std::time::Duration;

/// vaultlock - scheduled snapshots under an irreversible retention lock.
#[derive(Parser)]
#[command(name = "vaultlock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VAULTLOCK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding policies, snapshots and the audit log
    #[arg(long, env = "VAULTLOCK_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Directory holding the tracked objects
    #[arg(long, env = "VAULTLOCK_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Identity recorded in the audit log
    #[arg(long, env = "VAULTLOCK_ACTOR", default_value = "admin", global = true)]
    pub actor: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "VAULTLOCK_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Retention policy management
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Snapshot management
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Restore a snapshot into a new target
    Restore {
        /// Snapshot ID
        snapshot: SnapshotId,

        /// Name of the restored copy
        target: String,

        /// Replace a live object with the same name
        #[arg(long)]
        overwrite: bool,
    },

    /// Query the audit log
    Audit(AuditArgs),

    /// Summarize audit activity over a period
    Report {
        /// Period start (RFC 3339); defaults to 30 days ago
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Period end (RFC 3339); defaults to now
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Run one scheduler tick
    Tick,

    /// Mark expired snapshots
    Sweep {
        /// Delete expired snapshots after marking them
        #[arg(long)]
        purge: bool,
    },

    /// Run the scheduler until interrupted
    Serve,

    /// Show version information
    Version,
}

/// Policy subcommands.
#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Create a retention policy
    Create {
        /// Policy name
        name: String,

        /// Capture interval (e.g. 6h, 1d)
        #[arg(long, value_parser = parse_duration, required_unless_present = "hipaa")]
        interval: Option<Duration>,

        /// Retention duration (e.g. 90d)
        #[arg(long, value_parser = parse_duration, required_unless_present = "hipaa")]
        retention: Option<Duration>,

        /// Tracked object set name
        #[arg(long = "set")]
        set_name: String,

        /// Tracked object (repeatable)
        #[arg(long = "object", required = true)]
        objects: Vec<String>,

        /// Data classification (phi, pii, internal, public)
        #[arg(long)]
        classification: Option<DataClassification>,

        /// Daily capture, six-year retention, PHI classification
        #[arg(long, conflicts_with_all = ["interval", "retention"])]
        hipaa: bool,

        /// Stop scheduling captures after this time (RFC 3339)
        #[arg(long)]
        ends_at: Option<DateTime<Utc>>,
    },

    /// List policies
    List,

    /// Show a policy
    Show {
        /// Policy ID or name
        policy: String,
    },

    /// Engage the retention lock. This cannot be undone.
    Lock {
        /// Policy ID or name
        policy: String,
    },

    /// Change retention for future snapshots of an unlocked policy
    SetRetention {
        /// Policy ID or name
        policy: String,

        /// New retention duration
        #[arg(value_parser = parse_duration)]
        retention: Duration,
    },
}

/// Snapshot subcommands.
#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Capture a snapshot now
    Create {
        /// Policy ID or name
        policy: String,
    },

    /// List snapshots, newest first
    List {
        /// Only snapshots of this policy
        #[arg(short, long)]
        policy: Option<String>,
    },

    /// Show a snapshot
    Show {
        /// Snapshot ID
        id: SnapshotId,
    },

    /// Delete a snapshot
    Delete {
        /// Snapshot ID
        id: SnapshotId,
    },
}

/// Audit query filters.
#[derive(Args)]
pub struct AuditArgs {
    /// Events at or after this time (RFC 3339)
    #[arg(long)]
    pub from: Option<DateTime<Utc>>,

    /// Events at or before this time (RFC 3339)
    #[arg(long)]
    pub to: Option<DateTime<Utc>>,

    /// Only events by this actor
    #[arg(long)]
    pub actor: Option<String>,

    /// Only events of this type (e.g. DELETE_REJECTED)
    #[arg(long = "type")]
    pub event_type: Option<AuditEventType>,

    /// Only events about this policy or snapshot
    #[arg(long)]
    pub subject: Option<String>,

    /// Maximum number of events
    #[arg(long)]
    pub limit: Option<usize>,

    /// Print the matching events as a JSON export
    #[arg(long)]
    pub export: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_create_args() {
        let cli = Cli::try_parse_from([
            "vaultlock",
            "policy",
            "create",
            "clinical-6h",
            "--interval",
            "6h",
            "--retention",
            "90d",
            "--set",
            "clinical",
            "--object",
            "patients",
            "--object",
            "encounters",
            "--classification",
            "phi",
        ])
        .unwrap();

        match cli.command {
            Commands::Policy {
                command:
                    PolicyCommands::Create {
                        interval,
                        retention,
                        objects,
                        classification,
                        hipaa,
                        ..
                    },
            } => {
                assert_eq!(interval, Some(Duration::from_secs(6 * 3600)));
                assert_eq!(retention, Some(Duration::from_secs(90 * 86_400)));
                assert_eq!(objects, vec!["patients", "encounters"]);
                assert_eq!(classification, Some(DataClassification::Phi));
                assert!(!hipaa);
            }
            _ => panic!("expected policy create"),
        }
        assert_eq!(cli.actor, "admin");
    }

    #[test]
    fn test_hipaa_preset_needs_no_durations() {
        let cli = Cli::try_parse_from([
            "vaultlock", "policy", "create", "ehr", "--hipaa", "--set", "ehr", "--object", "charts",
        ]);
        assert!(cli.is_ok());

        let conflicting = Cli::try_parse_from([
            "vaultlock", "policy", "create", "ehr", "--hipaa", "--interval", "1h", "--set", "ehr",
            "--object", "charts",
        ]);
        assert!(conflicting.is_err());
    }

    #[test]
    fn test_missing_durations_rejected() {
        let cli = Cli::try_parse_from([
            "vaultlock", "policy", "create", "p", "--set", "s", "--object", "o",
        ]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_audit_filters() {
        let cli = Cli::try_parse_from([
            "vaultlock",
            "--actor",
            "auditor",
            "audit",
            "--type",
            "delete_rejected",
            "--from",
            "2024-01-01T00:00:00Z",
            "--limit",
            "10",
        ])
        .unwrap();

        match cli.command {
            Commands::Audit(args) => {
                assert_eq!(args.event_type, Some(AuditEventType::DeleteRejected));
                assert_eq!(args.limit, Some(10));
                assert!(args.from.is_some());
                assert!(!args.export);
            }
            _ => panic!("expected audit"),
        }
        assert_eq!(cli.actor, "auditor");
    }

    #[test]
    fn test_bad_snapshot_id() {
        assert!(Cli::try_parse_from(["vaultlock", "snapshot", "delete", "not-a-uuid"]).is_err());
    }
}
