//! Scheduling module for vaultlock.
//!
//! Drives policy snapshots on fixed interval boundaries.

mod engine;

pub use engine::{
    PolicyRunState, PolicyTick, SchedulerStats, SnapshotScheduler, TickOutcome, TickReport,
};
