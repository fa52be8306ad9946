//! Raft Log Entry Types
//!
//! Defines the structure of log entries that are appended by the leader,
//! replicated to followers and applied to every node's database.

use serde::{Deserialize, Serialize};

/// Position of an entry in the replicated log. Index 0 is the empty log.
pub type Index = u64;

/// Election epoch in which an entry was appended
pub type Term = u64;

/// Kind of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Client command, applied to the state machine
    Command,
    /// Voter configuration change
    MembershipChange,
    /// Empty entry appended by a new leader
    Noop,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Command => write!(f, "COMMAND"),
            EntryKind::MembershipChange => write!(f, "MEMBERSHIP_CHANGE"),
            EntryKind::Noop => write!(f, "NO_OP"),
        }
    }
}

/// Commands replicated through the log and applied by the apply loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Create a cluster-wide connection. Its ID is the entry's index.
    CreateConnection {
        client: String,
    },

    /// Execute a statement batch on behalf of a connection
    Execute {
        connection: u64,
        statements: Vec<String>,
        /// Run the batch atomically, stopping at the first failure
        #[serde(default)]
        transaction: bool,
    },

    /// Read through the log for linearizable results
    Query {
        connection: u64,
        statements: Vec<String>,
    },
}

/// A single-node change to the voter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    /// Add a voter, or update the address of an existing one
    AddNode { id: String, address: String },
    /// Remove a voter
    RemoveNode { id: String },
}

impl MembershipChange {
    /// The node this change is about
    pub fn node_id(&self) -> &str {
        match self {
            MembershipChange::AddNode { id, .. } | MembershipChange::RemoveNode { id } => id,
        }
    }
}

impl std::fmt::Display for MembershipChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipChange::AddNode { id, address } => write!(f, "add {} at {}", id, address),
            MembershipChange::RemoveNode { id } => write!(f, "remove {}", id),
        }
    }
}

/// Entry payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Noop,
    Command(Command),
    Membership(MembershipChange),
}

/// A replicated log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log position
    pub index: Index,
    /// Leader term when appended
    pub term: Term,
    /// Assigned by the leader at append time so every node sees the same value
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// What the entry does
    pub payload: Payload,
}

impl LogEntry {
    /// Create a new entry stamped with the current time
    pub fn new(index: Index, term: Term, payload: Payload) -> Self {
        Self {
            index,
            term,
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    /// Get the entry kind
    pub fn kind(&self) -> EntryKind {
        match self.payload {
            Payload::Noop => EntryKind::Noop,
            Payload::Command(_) => EntryKind::Command,
            Payload::Membership(_) => EntryKind::MembershipChange,
        }
    }

    /// Membership change carried by this entry, if any
    pub fn membership(&self) -> Option<&MembershipChange> {
        match &self.payload {
            Payload::Membership(change) => Some(change),
            _ => None,
        }
    }

    /// Serialize entry to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize entry from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind() {
        let noop = LogEntry::new(1, 1, Payload::Noop);
        assert_eq!(noop.kind(), EntryKind::Noop);

        let join = LogEntry::new(
            2,
            1,
            Payload::Membership(MembershipChange::AddNode {
                id: "node-2".into(),
                address: "127.0.0.1:4002".into(),
            }),
        );
        assert_eq!(join.kind(), EntryKind::MembershipChange);
        assert_eq!(join.membership().unwrap().node_id(), "node-2");
    }

    #[test]
    fn test_serialize_preserves_timestamp() {
        let entry = LogEntry::new(
            7,
            3,
            Payload::Command(Command::Execute {
                connection: 5,
                statements: vec!["INSERT INTO foo(name) VALUES('fiona')".into()],
                transaction: false,
            }),
        );

        let bytes = entry.serialize().unwrap();
        let restored = LogEntry::deserialize(&bytes).unwrap();
        assert_eq!(restored, entry);
        assert_eq!(restored.timestamp, entry.timestamp);
    }
}
