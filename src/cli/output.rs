//! Output formatting for CLI

use crate::config::humantime_serde::format_duration;
use crate::error::Result;
use crate::snapshot::Snapshot;
use crate::worm::{AuditEvent, RetentionPolicy};
use chrono::{DateTime, SecondsFormat, Utc};
use console::{style, Style};
use serde::Serialize;
use std::fmt::Display;
use tabled::{settings::Style as TableStyle, Table, Tabled};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
}

/// Format and print data in the specified format
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", style("No results found").dim());
            } else {
                let table = Table::new(data).with(TableStyle::rounded()).to_string();
                println!("{}", table);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
        OutputFormat::Csv => {
            if let Some(first) = data.first() {
                if let serde_json::Value::Object(map) = serde_json::to_value(first)? {
                    let headers: Vec<_> = map.keys().map(|k| k.as_str()).collect();
                    println!("{}", headers.join(","));
                }
            }
            for item in data {
                if let serde_json::Value::Object(map) = serde_json::to_value(item)? {
                    let values: Vec<_> = map
                        .values()
                        .map(|v| match v {
                            serde_json::Value::String(s) => csv_field(s),
                            other => other.to_string(),
                        })
                        .collect();
                    println!("{}", values.join(","));
                }
            }
        }
    }
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Print a single item
pub fn print_single<T: Serialize>(data: &T, _format: OutputFormat) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

/// Success message
pub fn success(msg: impl Display) {
    println!("{} {}", style("✓").green().bold(), msg);
}

/// Warning message
pub fn warning(msg: impl Display) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

/// Error message
pub fn error(msg: impl Display) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

/// Print a key-value pair
pub fn print_kv(key: &str, value: impl Display) {
    let key_style = Style::new().cyan().bold();
    println!("{}: {}", key_style.apply_to(key), value);
}

/// Format bytes as human-readable size
pub fn format_bytes(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Lock state with color
pub fn lock_indicator(locked: bool) -> String {
    if locked {
        format!("{}", style("LOCKED").red().bold())
    } else {
        format!("{}", style("unlocked").green())
    }
}

/// Policy table row
#[derive(Debug, Serialize, Tabled)]
pub struct PolicyRow {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub retention: String,
    pub tracked: String,
    pub classification: String,
    pub lock: String,
}

impl From<&RetentionPolicy> for PolicyRow {
    fn from(policy: &RetentionPolicy) -> Self {
        let terms = policy.terms();
        Self {
            id: terms.id.to_string(),
            name: terms.name.clone(),
            schedule: format!("every {}", format_duration(terms.schedule_interval)),
            retention: format_duration(terms.retention),
            tracked: format!("{} ({})", terms.tracked.name(), terms.tracked.objects().len()),
            classification: terms.tracked.classification().to_string(),
            lock: match policy.locked_at() {
                Some(at) => format!("locked {}", format_time(at)),
                None => "unlocked".to_string(),
            },
        }
    }
}

/// Snapshot table row
#[derive(Debug, Serialize, Tabled)]
pub struct SnapshotRow {
    pub id: String,
    pub policy: String,
    pub created: String,
    pub expires: String,
    pub state: String,
    pub objects: u64,
    pub size: String,
}

impl SnapshotRow {
    /// Row for `snapshot` as seen at `now`.
    pub fn new(snapshot: &Snapshot, now: DateTime<Utc>) -> Self {
        Self {
            id: snapshot.id().to_string(),
            policy: snapshot.policy_name().to_string(),
            created: format_time(snapshot.created_at()),
            expires: format_time(snapshot.expires_at()),
            state: snapshot.effective_state(now).to_string(),
            objects: snapshot.object_count(),
            size: format_bytes(snapshot.total_bytes()),
        }
    }
}

/// Audit event table row
#[derive(Debug, Serialize, Tabled)]
pub struct AuditRow {
    pub seq: u64,
    pub time: String,
    pub event: String,
    pub actor: String,
    pub subject: String,
    pub outcome: String,
}

impl From<&AuditEvent> for AuditRow {
    fn from(event: &AuditEvent) -> Self {
        Self {
            seq: event.sequence,
            time: format_time(event.timestamp),
            event: event.event_type.to_string(),
            actor: event.actor.clone(),
            subject: event.subject_id.clone(),
            outcome: event.outcome.to_string(),
        }
    }
}
