//! Replication Module
//!
//! Raft consensus: the node state machine, its leader and follower halves,
//! the task that drives it and the loop that applies committed entries.

pub mod protocol;
mod node;
mod leader;
mod follower;
mod engine;
mod apply;

pub use protocol::{
    ClientReply, ClientRequest, ErrorCode, FrameHeader, Message, MessageCodec, ReadConsistency,
};
pub use node::{Outbound, RaftConfig, RaftNode};
pub use leader::ProposalCheck;
pub use engine::{Committed, Proposal, RaftEngine, RaftHandle, RaftStatus};
pub use apply::{ApplyLoop, ApplyOutcome, Waiters};
