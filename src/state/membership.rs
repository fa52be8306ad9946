//! Cluster Membership Management
//!
//! The voter configuration as of the last applied membership change. The
//! configuration is only ever mutated by committed `MembershipChange`
//! entries, one at a time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::wal::{Index, MembershipChange};

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Node is the cluster leader
    Leader,
    /// Node is a follower
    Follower,
    /// Node is a candidate (during election)
    Candidate,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "LEADER"),
            NodeRole::Follower => write!(f, "FOLLOWER"),
            NodeRole::Candidate => write!(f, "CANDIDATE"),
        }
    }
}

/// A voter in the cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Unique node identifier
    pub id: String,
    /// Node address (host:port)
    pub address: String,
    /// Index of the entry that added this node (0 for the bootstrap voter)
    pub added_at: Index,
}

/// Outcome of applying a membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Added,
    Updated,
    Removed,
    Unchanged,
}

/// Cluster membership tracker
#[derive(Debug, Clone)]
pub struct ClusterMembership {
    /// This node's ID
    node_id: String,
    /// Voters by ID
    voters: BTreeMap<String, NodeState>,
}

impl ClusterMembership {
    /// An empty configuration. A node in this state knows no voters and
    /// waits to be contacted by a leader.
    pub fn new(node_id: String) -> Self {
        Self {
            node_id,
            voters: BTreeMap::new(),
        }
    }

    /// A configuration containing only this node
    pub fn bootstrap(node_id: String, address: String) -> Self {
        let mut membership = Self::new(node_id.clone());
        membership.voters.insert(
            node_id.clone(),
            NodeState {
                id: node_id,
                address,
                added_at: 0,
            },
        );
        membership
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Apply a committed change. Appended changes take effect only once
    /// they commit, on the leader as everywhere else.
    pub fn apply_change(&mut self, change: &MembershipChange, index: Index) -> ChangeOutcome {
        match change {
            MembershipChange::AddNode { id, address } => match self.voters.get_mut(id) {
                Some(node) if node.address == *address => ChangeOutcome::Unchanged,
                Some(node) => {
                    node.address = address.clone();
                    ChangeOutcome::Updated
                }
                None => {
                    self.voters.insert(
                        id.clone(),
                        NodeState {
                            id: id.clone(),
                            address: address.clone(),
                            added_at: index,
                        },
                    );
                    ChangeOutcome::Added
                }
            },
            MembershipChange::RemoveNode { id } => match self.voters.remove(id) {
                Some(_) => ChangeOutcome::Removed,
                None => ChangeOutcome::Unchanged,
            },
        }
    }

    /// Whether the change would leave the configuration as it is
    pub fn is_noop(&self, change: &MembershipChange) -> bool {
        match change {
            MembershipChange::AddNode { id, address } => {
                self.voters.get(id).map(|n| &n.address) == Some(address)
            }
            MembershipChange::RemoveNode { id } => !self.voters.contains_key(id),
        }
    }

    /// Number of votes needed for a strict majority
    pub fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Whether a node is a voter
    pub fn is_voter(&self, id: &str) -> bool {
        self.voters.contains_key(id)
    }

    /// Whether this node is a voter
    pub fn is_self_voter(&self) -> bool {
        self.voters.contains_key(&self.node_id)
    }

    /// Address of a voter
    pub fn address_of(&self, id: &str) -> Option<&str> {
        self.voters.get(id).map(|n| n.address.as_str())
    }

    /// All voter IDs, in order
    pub fn voter_ids(&self) -> Vec<String> {
        self.voters.keys().cloned().collect()
    }

    /// Voters other than this node
    pub fn peers(&self) -> impl Iterator<Item = &NodeState> {
        self.voters.values().filter(move |n| n.id != self.node_id)
    }

    /// All voters
    pub fn voters(&self) -> impl Iterator<Item = &NodeState> {
        self.voters.values()
    }

    /// Number of voters
    pub fn len(&self) -> usize {
        self.voters.len()
    }

    /// Whether there are no voters
    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(id: &str, address: &str) -> MembershipChange {
        MembershipChange::AddNode {
            id: id.into(),
            address: address.into(),
        }
    }

    #[test]
    fn test_quorum_grows_with_voters() {
        let mut membership = ClusterMembership::bootstrap("n1".into(), "127.0.0.1:1".into());
        assert_eq!(membership.quorum_size(), 1);

        membership.apply_change(&add("n2", "127.0.0.1:2"), 2);
        assert_eq!(membership.quorum_size(), 2);

        membership.apply_change(&add("n3", "127.0.0.1:3"), 4);
        assert_eq!(membership.quorum_size(), 2);
        assert_eq!(membership.peers().count(), 2);
    }

    #[test]
    fn test_rejoin_same_address_is_unchanged() {
        let mut membership = ClusterMembership::bootstrap("n1".into(), "127.0.0.1:1".into());
        membership.apply_change(&add("n2", "127.0.0.1:2"), 2);

        assert!(membership.is_noop(&add("n2", "127.0.0.1:2")));
        assert_eq!(
            membership.apply_change(&add("n2", "127.0.0.1:2"), 3),
            ChangeOutcome::Unchanged
        );
        assert_eq!(
            membership.apply_change(&add("n2", "127.0.0.1:9"), 4),
            ChangeOutcome::Updated
        );
        assert_eq!(membership.address_of("n2"), Some("127.0.0.1:9"));
    }

    #[test]
    fn test_remove() {
        let mut membership = ClusterMembership::bootstrap("n1".into(), "127.0.0.1:1".into());
        membership.apply_change(&add("n2", "127.0.0.1:2"), 2);

        let remove = MembershipChange::RemoveNode { id: "n1".into() };
        assert_eq!(membership.apply_change(&remove, 3), ChangeOutcome::Removed);
        assert!(!membership.is_self_voter());
        assert_eq!(membership.voter_ids(), vec!["n2".to_string()]);
    }
}
