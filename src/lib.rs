//! vaultlock - policy-driven snapshots under an irreversible retention lock.
//!
//! A retention policy binds a tracked object set to a capture schedule and a
//! retention duration. The scheduler captures one snapshot per policy per
//! interval. Once a policy's retention lock is engaged, every snapshot it
//! produces afterwards is LOCKED and cannot be deleted before its expiry by
//! any caller, however privileged.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Vault                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scheduler: interval slots | expiry sweep                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Snapshots: create | delete | list    Restore Engine         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  WORM: policies | retention lock authority | audit log       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage: memory | JSON documents    Data: memory | dirs     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use vaultlock::config::VaultConfig;
//! use vaultlock::Vault;
//!
//! #[tokio::main]
//! async fn main() -> vaultlock::Result<()> {
//!     let config = VaultConfig::development()
//!         .with_state_dir("/var/lib/vaultlock")
//!         .with_data_dir("/srv/clinical");
//!
//!     let vault = Vault::open(config).await?;
//!     let report = vault.tick().await;
//!     println!("created {} snapshots", report.created().len());
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub mod observability;
pub mod restore;
pub mod scheduling;
pub mod shutdown;
pub mod snapshot;
pub mod source;
pub mod vault;
pub mod worm;

pub mod cli;

mod persist;

pub use error::{Result, VaultError};
pub use vault::Vault;
