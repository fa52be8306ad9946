//! Leader Election
//!
//! Randomized election timers, vote tallying and the log comparison used
//! when deciding whether to grant a vote.

use rand::Rng;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::wal::{Index, Term};

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Minimum election timeout in milliseconds
    pub timeout_min_ms: u64,
    /// Maximum election timeout in milliseconds
    pub timeout_max_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            timeout_min_ms: 1000,
            timeout_max_ms: 2000,
        }
    }
}

impl ElectionConfig {
    /// Generate a random election timeout
    pub fn random_timeout(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let ms = rng.gen_range(self.timeout_min_ms..=self.timeout_max_ms);
        Duration::from_millis(ms)
    }

    /// The shortest timeout a node may use, which bounds check-quorum
    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_min_ms)
    }
}

/// Election timer, reset on every valid contact from a leader
#[derive(Debug)]
pub struct ElectionTimer {
    config: ElectionConfig,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(config: ElectionConfig) -> Self {
        let deadline = Instant::now() + config.random_timeout();
        Self { config, deadline }
    }

    /// Reset the timer with a fresh random timeout
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.config.random_timeout();
    }

    /// Check if the election timeout has expired
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }
}

/// Votes collected by a candidate in one term
#[derive(Debug, Default)]
pub struct Ballot {
    granted: HashSet<String>,
}

impl Ballot {
    /// A ballot carrying the candidate's own vote
    pub fn new(node_id: &str) -> Self {
        let mut ballot = Self::default();
        ballot.granted.insert(node_id.to_string());
        ballot
    }

    /// Record a peer's answer
    pub fn record(&mut self, voter: &str, granted: bool) {
        if granted {
            self.granted.insert(voter.to_string());
        }
    }

    /// Count granted votes among the given voters
    pub fn granted_among<'a>(&self, voters: impl Iterator<Item = &'a str>) -> usize {
        voters.filter(|v| self.granted.contains(*v)).count()
    }
}

/// Whether a candidate's log is at least as up to date as ours: a later
/// last term wins, and equal terms compare by last index.
pub fn log_is_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: Index,
    our_last_term: Term,
    our_last_index: Index,
) -> bool {
    candidate_last_term > our_last_term
        || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
}
