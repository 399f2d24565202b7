//! Core engine: the calendar → consensus → entry → monitor loop.
//!
//! - `consensus`: parallel sentiment sampling and the Good/Mixed/Bad verdict.
//! - `lifecycle`: entries, trailing stops, exits, and idle capital.
//! - `movement`: post-earnings price reaction backfill.
//! - `scheduler`: the polling loop and live config reload.

pub mod consensus;
pub mod lifecycle;
pub mod movement;
pub mod scheduler;

pub use consensus::{ConsensusConfig, ConsensusEngine, ConsensusOutcome};
pub use lifecycle::{EntryOutcome, LifecycleSettings, MonitorReport, TradeLifecycleManager};
pub use movement::{BackfillReport, MovementResolver};
pub use scheduler::{CycleReport, Scheduler, SchedulerSettings};
