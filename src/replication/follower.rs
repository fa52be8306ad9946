//! Follower Node Implementation
//!
//! Handles append requests from the leader: log consistency checks,
//! truncation of conflicting suffixes and commit propagation.

use std::time::Instant;

use super::node::RaftNode;
use super::protocol::Message;
use crate::error::{Error, Result};
use crate::state::NodeRole;
use crate::wal::{Index, LogEntry, Term};

impl RaftNode {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: String,
        leader_address: String,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
    ) -> Result<Message> {
        if term < self.term {
            return Ok(self.append_reply(false, 0, 0));
        }

        if term > self.term || !self.is_follower_of(&leader_id) {
            self.become_follower(term, Some(leader_id), Some(leader_address));
        }
        self.leader_contact = Some(Instant::now());
        self.timer.reset();

        // The log must contain the entry preceding the new ones.
        if prev_index > self.log.last_index() {
            let hint = self.log.last_index() + 1;
            tracing::debug!(
                "Missing entries before index {}, asking leader to resume at {}",
                prev_index,
                hint
            );
            return Ok(self.append_reply(false, 0, hint));
        }

        let local_term = self.log.term_at(prev_index).unwrap_or(0);
        if local_term != prev_term {
            let hint = self
                .log
                .first_index_of_term(local_term, prev_index)
                .max(self.commit + 1);
            tracing::debug!(
                "Log mismatch at index {} (term {} vs {}), asking leader to resume at {}",
                prev_index,
                local_term,
                prev_term,
                hint
            );
            return Ok(self.append_reply(false, 0, hint));
        }

        let match_index = prev_index + entries.len() as Index;
        self.store_entries(entries)?;

        let commit = leader_commit.min(match_index);
        if commit > self.commit {
            self.advance_commit(commit);
        }

        Ok(self.append_reply(true, match_index, 0))
    }

    /// Append entries from the leader, skipping those already present and
    /// truncating at the first conflicting one
    fn store_entries(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut fresh = Vec::new();
        for entry in entries {
            if !fresh.is_empty() {
                fresh.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit {
                        return Err(Error::Internal(format!(
                            "Leader sent conflicting entry at committed index {}",
                            entry.index
                        )));
                    }
                    self.log.truncate_from(entry.index)?;
                    if matches!(&self.pending_change, Some((i, _)) if *i >= entry.index) {
                        self.pending_change = None;
                    }
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }

        if fresh.is_empty() {
            return Ok(());
        }

        for entry in &fresh {
            if let Some(change) = entry.membership() {
                self.pending_change = Some((entry.index, change.clone()));
            }
        }
        self.log.append(&fresh)
    }

    fn is_follower_of(&self, leader_id: &str) -> bool {
        self.role() == NodeRole::Follower && self.leader_id.as_deref() == Some(leader_id)
    }

    fn append_reply(&self, success: bool, match_index: Index, conflict_index: Index) -> Message {
        Message::AppendEntriesResponse {
            node_id: self.config.node_id.clone(),
            term: self.term,
            success,
            match_index,
            conflict_index,
        }
    }
}
