//! State Management Module
//!
//! Handles persistent Raft state, the voter configuration and the
//! election timers and ballots.

mod tracker;
mod membership;
pub mod election;

pub use tracker::{HardState, StateTracker};
pub use membership::{ChangeOutcome, ClusterMembership, NodeRole, NodeState};
pub use election::{log_is_up_to_date, Ballot, ElectionConfig, ElectionTimer};
