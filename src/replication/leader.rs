//! Leader Node Implementation
//!
//! Handles leader responsibilities: accepting proposals, replicating to
//! followers and learners, advancing the commit index and managing
//! cluster membership.

use std::collections::HashMap;
use std::time::Instant;

use super::node::{Outbound, RaftNode, RoleState};
use super::protocol::Message;
use crate::error::{Error, Result};
use crate::wal::{Index, LogEntry, MembershipChange, Payload, Term};

/// Replication progress of one peer
#[derive(Debug, Clone)]
pub(super) struct Progress {
    pub address: String,
    /// Next index to send
    pub next: Index,
    /// Highest index known to be stored on the peer
    pub matched: Index,
    /// An append is outstanding
    pub inflight: bool,
    /// Last reply from the peer
    pub last_contact: Instant,
}

impl Progress {
    fn new(address: String, next: Index, now: Instant) -> Self {
        Self {
            address,
            next,
            matched: 0,
            inflight: false,
            last_contact: now,
        }
    }
}

/// Leader-only state
pub(super) struct LeaderState {
    /// Progress per replication target (voters and the pending learner)
    pub progress: HashMap<String, Progress>,
    pub last_heartbeat: Instant,
}

/// Result of vetting a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalCheck {
    /// Append it
    Ready,
    /// The membership change is already in effect
    AlreadyApplied,
}

impl RaftNode {
    pub(super) fn become_leader(&mut self) {
        let now = Instant::now();
        tracing::info!(
            "Node {} became leader for term {}",
            self.config.node_id,
            self.term
        );

        self.leader_id = Some(self.config.node_id.clone());
        self.leader_address = Some(self.config.address.clone());
        self.leader_contact = None;

        let next = self.log.last_index() + 1;
        let progress = self
            .replication_targets()
            .into_iter()
            .map(|(id, address)| (id, Progress::new(address, next, now)))
            .collect();
        self.role = RoleState::Leader(LeaderState {
            progress,
            last_heartbeat: now,
        });

        // Entries from earlier terms only commit once an entry from this
        // term does.
        let noop = LogEntry::new(next, self.term, Payload::Noop);
        if let Err(e) = self.log.append(&[noop]) {
            tracing::error!("Failed to append no-op as new leader: {}", e);
            let term = self.term;
            self.become_follower(term, None, None);
            return;
        }

        self.broadcast_append();
        self.maybe_commit();
    }

    /// Vet a proposal without changing any state
    pub fn check_proposal(&self, payload: &Payload, now: Instant) -> Result<ProposalCheck> {
        if !self.is_leader() {
            return Err(match &self.leader_id {
                Some(leader) => Error::NotLeader {
                    leader: Some(leader.clone()),
                },
                None => Error::NoLeader,
            });
        }

        let (reached, required) = self.recent_quorum(now);
        if reached < required {
            return Err(Error::QuorumNotReached { reached, required });
        }

        if let Payload::Membership(change) = payload {
            if let Some((index, pending)) = &self.pending_change {
                return Err(Error::JoinFailed(format!(
                    "membership change '{}' at index {} is still uncommitted",
                    pending, index
                )));
            }

            if let MembershipChange::RemoveNode { id } = change {
                if !self.membership.is_voter(id) {
                    return Err(Error::NodeNotFound(id.clone()));
                }
                if self.membership.len() == 1 {
                    return Err(Error::JoinFailed("cannot remove the last voter".into()));
                }
            }

            if self.membership.is_noop(change) {
                return Ok(ProposalCheck::AlreadyApplied);
            }
        }

        Ok(ProposalCheck::Ready)
    }

    /// Append a vetted proposal and start replicating it
    pub fn append_proposal(&mut self, payload: Payload) -> Result<(Index, Term)> {
        if !self.is_leader() {
            return Err(Error::NotLeader {
                leader: self.leader_id.clone(),
            });
        }

        let index = self.log.last_index() + 1;
        let entry = LogEntry::new(index, self.term, payload);
        self.log.append(std::slice::from_ref(&entry))?;

        if let Some(change) = entry.membership() {
            tracing::info!("Proposed membership change at index {}: {}", index, change);
            self.pending_change = Some((index, change.clone()));
            self.sync_progress();
        }

        self.broadcast_append();
        self.maybe_commit();
        Ok((index, self.term))
    }

    /// Voters heard from within the election timeout, and the quorum size
    pub fn recent_quorum(&self, now: Instant) -> (usize, usize) {
        let required = self.membership.quorum_size();
        let RoleState::Leader(leader) = &self.role else {
            return (0, required);
        };

        let window = self.config.election.min_timeout();
        let reached = self
            .membership
            .voters()
            .filter(|n| {
                n.id == self.config.node_id
                    || leader
                        .progress
                        .get(&n.id)
                        .map(|p| now.saturating_duration_since(p.last_contact) < window)
                        .unwrap_or(false)
            })
            .count();
        (reached, required)
    }

    pub(super) fn leader_tick(&mut self, now: Instant) -> Result<()> {
        let (reached, required) = self.recent_quorum(now);
        if reached < required {
            tracing::warn!(
                "Leader {} lost contact with quorum ({}/{}), stepping down",
                self.config.node_id,
                reached,
                required
            );
            let term = self.term;
            self.become_follower(term, None, None);
            return Ok(());
        }

        let due = match &mut self.role {
            RoleState::Leader(leader)
                if now.saturating_duration_since(leader.last_heartbeat)
                    >= self.config.heartbeat_interval =>
            {
                leader.last_heartbeat = now;
                true
            }
            _ => false,
        };
        if due {
            self.broadcast_append();
        }

        self.reap(now)
    }

    /// Remove the first voter that has been silent past the reap timeout
    fn reap(&mut self, now: Instant) -> Result<()> {
        let Some(timeout) = self.config.reap_timeout else {
            return Ok(());
        };
        if self.pending_change.is_some() || self.membership.len() <= 1 {
            return Ok(());
        }
        let RoleState::Leader(leader) = &self.role else {
            return Ok(());
        };

        let silent = self.membership.peers().find(|n| {
            leader
                .progress
                .get(&n.id)
                .map(|p| now.saturating_duration_since(p.last_contact) > timeout)
                .unwrap_or(false)
        });

        if let Some(node) = silent {
            let id = node.id.clone();
            tracing::warn!("Reaping node {} after {:?} of silence", id, timeout);
            self.append_proposal(Payload::Membership(MembershipChange::RemoveNode { id }))?;
        }
        Ok(())
    }

    /// Send an append (possibly empty, acting as heartbeat) to every peer
    /// without one outstanding
    pub(super) fn broadcast_append(&mut self) {
        let idle: Vec<String> = match &self.role {
            RoleState::Leader(leader) => leader
                .progress
                .iter()
                .filter(|(_, p)| !p.inflight)
                .map(|(id, _)| id.clone())
                .collect(),
            _ => return,
        };
        for peer in idle {
            self.send_append(&peer);
        }
    }

    fn send_append(&mut self, peer: &str) {
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        let Some(progress) = leader.progress.get_mut(peer) else {
            return;
        };

        let last = self.log.last_index();
        if progress.next > last + 1 {
            progress.next = last + 1;
        }
        let prev_index = progress.next - 1;
        let prev_term = self.log.term_at(prev_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(progress.next, self.config.max_batch_entries);

        if !entries.is_empty() {
            tracing::debug!(
                "Replicating {} entries to {} starting at index {}",
                entries.len(),
                peer,
                progress.next
            );
        }

        progress.inflight = true;
        self.outbox.push(Outbound {
            to: peer.to_string(),
            address: progress.address.clone(),
            message: Message::AppendEntries {
                term: self.term,
                leader_id: self.config.node_id.clone(),
                leader_address: self.config.address.clone(),
                prev_index,
                prev_term,
                entries,
                leader_commit: self.commit,
            },
        });
    }

    pub(super) fn on_append_response(
        &mut self,
        node_id: &str,
        term: Term,
        success: bool,
        match_index: Index,
        conflict_index: Index,
    ) -> Result<()> {
        if term < self.term {
            return Ok(());
        }
        let RoleState::Leader(leader) = &mut self.role else {
            return Ok(());
        };
        let Some(progress) = leader.progress.get_mut(node_id) else {
            return Ok(());
        };

        progress.inflight = false;
        progress.last_contact = Instant::now();

        if success {
            progress.matched = progress.matched.max(match_index);
            progress.next = progress.matched + 1;
        } else {
            let hint = if conflict_index > 0 {
                conflict_index
            } else {
                progress.next.saturating_sub(1)
            };
            progress.next = hint.max(progress.matched + 1);
            tracing::debug!(
                "Follower {} rejected append, resuming from index {}",
                node_id,
                progress.next
            );
        }

        let behind = !success || progress.next <= self.log.last_index();
        self.maybe_commit();
        if behind && self.is_leader() {
            self.send_append(node_id);
        }
        Ok(())
    }

    /// Commit the highest index stored on a quorum of voters, provided it
    /// belongs to the current term
    fn maybe_commit(&mut self) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };

        let mut matched: Vec<Index> = self
            .membership
            .voters()
            .map(|n| {
                if n.id == self.config.node_id {
                    self.log.last_index()
                } else {
                    leader.progress.get(&n.id).map(|p| p.matched).unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }

        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = matched[self.membership.quorum_size() - 1];
        if quorum_index > self.commit && self.log.term_at(quorum_index) == Some(self.term) {
            self.advance_commit(quorum_index);
        }
    }

    /// Reconcile leader state with a newly committed configuration
    pub(super) fn after_leader_commit(&mut self) {
        if !self.membership.is_self_voter() {
            tracing::info!(
                "Leader {} removed from the cluster, stepping down",
                self.config.node_id
            );
            let term = self.term;
            self.become_follower(term, None, None);
            return;
        }
        self.sync_progress();
    }

    /// Committed peers plus the learner named by a pending `AddNode`
    fn replication_targets(&self) -> Vec<(String, String)> {
        let mut targets: Vec<(String, String)> = self
            .membership
            .peers()
            .map(|n| (n.id.clone(), n.address.clone()))
            .collect();

        if let Some((_, MembershipChange::AddNode { id, address })) = &self.pending_change {
            if *id != self.config.node_id {
                match targets.iter_mut().find(|(t, _)| t == id) {
                    Some(target) => target.1 = address.clone(),
                    None => targets.push((id.clone(), address.clone())),
                }
            }
        }
        targets
    }

    fn sync_progress(&mut self) {
        let targets = self.replication_targets();
        let next = self.log.last_index() + 1;
        let now = Instant::now();

        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        leader
            .progress
            .retain(|id, _| targets.iter().any(|(t, _)| t == id));
        for (id, address) in targets {
            leader
                .progress
                .entry(id)
                .and_modify(|p| p.address = address.clone())
                .or_insert_with(|| Progress::new(address, next, now));
        }
    }
}
