//! Strategy policy: entry sizing, risk gates, and exit timing.
//!
//! Everything here is pure: inputs are balances, prices, configuration and
//! times; outputs are sizes, levels, or a `RejectionReason`. The trade
//! lifecycle manager in `engine::lifecycle` does the I/O around it.

pub mod exit;
pub mod risk;
pub mod sizing;

pub use risk::RejectionReason;
pub use sizing::{plan_entry, EntryPlan};
