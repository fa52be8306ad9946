//! raftlite - Distributed SQLite over Raft
//!
//! A cluster of nodes agrees on an ordered log of SQL commands and replays
//! it into a node-local SQLite database on every member.
//!
//! # Architecture
//!
//! One node leads at a time. Writes, connection creation and membership
//! changes are appended to the leader's log, replicated to a quorum and
//! applied in index order on every node. Followers forward what they
//! cannot serve to the leader.
//!
//! # Features
//!
//! - Raft leader election with check-quorum and randomized timeouts
//! - Durable, CRC-checked log with truncation of conflicting suffixes
//! - Single-change membership (join/remove) with learner catch-up
//! - Replicated client connections that survive the node they were made on
//! - Read consistency levels: none, weak and strong
//! - HTTP API for connections, statements and cluster management

pub mod config;
pub mod error;
pub mod wal;
pub mod state;
pub mod replication;
pub mod executor;
pub mod network;
pub mod session;
pub mod api;
pub mod server;
pub mod cluster;

pub use config::RaftliteConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::LocalCluster;
    pub use crate::config::RaftliteConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{ExecuteResponse, QueryResponse, StatementResult};
    pub use crate::replication::{RaftHandle, RaftStatus, ReadConsistency};
    pub use crate::server::RaftliteNode;
    pub use crate::session::{Connection, ConnectionInfo, RequestRouter};
}
