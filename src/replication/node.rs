//! Raft Node
//!
//! The consensus state machine. A `RaftNode` is owned by a single task and
//! never blocks: inbound requests return their reply directly, and messages
//! to peers are collected in an outbox that the driver drains after every
//! step. Hard state changes must be persisted by the driver before any
//! reply or outbox message leaves the node.

use std::time::{Duration, Instant};

use super::leader::LeaderState;
use super::protocol::Message;
use crate::config::RaftliteConfig;
use crate::error::{Error, Result};
use crate::state::{
    log_is_up_to_date, Ballot, ClusterMembership, ElectionConfig, ElectionTimer, HardState,
    NodeRole, NodeState,
};
use crate::wal::{Index, LogEntry, LogStore, MembershipChange, Payload, Term};

/// Consensus configuration for one node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: String,
    /// Address peers use to reach this node
    pub address: String,
    pub election: ElectionConfig,
    pub heartbeat_interval: Duration,
    pub max_batch_entries: usize,
    /// Remove voters silent for this long (leader only)
    pub reap_timeout: Option<Duration>,
}

impl RaftConfig {
    pub fn from_config(config: &RaftliteConfig, address: String) -> Self {
        Self {
            node_id: config.node.id.clone(),
            address,
            election: ElectionConfig {
                timeout_min_ms: config.cluster.election_timeout_min_ms,
                timeout_max_ms: config.cluster.election_timeout_max_ms,
            },
            heartbeat_interval: config.heartbeat_interval(),
            max_batch_entries: config.cluster.max_batch_entries,
            reap_timeout: config.reap_timeout(),
        }
    }
}

/// A message queued for a peer
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: String,
    pub address: String,
    pub message: Message,
}

/// Role-specific state
pub(super) enum RoleState {
    Follower,
    Candidate(Ballot),
    Leader(LeaderState),
}

/// Raft consensus state for one node
pub struct RaftNode {
    pub(super) config: RaftConfig,
    pub(super) term: Term,
    pub(super) voted_for: Option<String>,
    pub(super) leader_id: Option<String>,
    pub(super) leader_address: Option<String>,
    /// Last time a current leader contacted us
    pub(super) leader_contact: Option<Instant>,
    pub(super) log: LogStore,
    pub(super) commit: Index,
    /// Highest index handed to the apply loop
    pub(super) handed_off: Index,
    /// Voter configuration as of `commit`
    pub(super) membership: ClusterMembership,
    /// Appended but uncommitted membership change
    pub(super) pending_change: Option<(Index, MembershipChange)>,
    pub(super) timer: ElectionTimer,
    pub(super) role: RoleState,
    pub(super) outbox: Vec<Outbound>,
}

impl RaftNode {
    /// Restore a node from its log and persisted hard state. With
    /// `bootstrap` and an empty log the node seeds a configuration holding
    /// only itself.
    pub fn new(
        config: RaftConfig,
        mut log: LogStore,
        hard_state: HardState,
        bootstrap: bool,
    ) -> Result<Self> {
        let mut term = hard_state.term;
        let mut commit = hard_state.commit.min(log.last_index());

        if bootstrap && log.is_empty() {
            term = term.max(1);
            let seed = LogEntry::new(
                1,
                term,
                Payload::Membership(MembershipChange::AddNode {
                    id: config.node_id.clone(),
                    address: config.address.clone(),
                }),
            );
            log.append(&[seed])?;
            commit = 1;
            tracing::info!("Bootstrapped single-voter cluster with node {}", config.node_id);
        }

        let mut membership = ClusterMembership::new(config.node_id.clone());
        let mut pending_change = None;
        for entry in log.range(1, log.last_index()) {
            if let Some(change) = entry.membership() {
                if entry.index <= commit {
                    membership.apply_change(change, entry.index);
                } else {
                    pending_change = Some((entry.index, change.clone()));
                }
            }
        }

        let timer = ElectionTimer::new(config.election.clone());
        Ok(Self {
            config,
            term,
            voted_for: hard_state.voted_for,
            leader_id: None,
            leader_address: None,
            leader_contact: None,
            log,
            commit,
            handed_off: 0,
            membership,
            pending_change,
            timer,
            role: RoleState::Follower,
            outbox: Vec::new(),
        })
    }

    /// Get this node's ID
    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    /// Get this node's address
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Get current term
    pub fn term(&self) -> Term {
        self.term
    }

    /// Get the current role
    pub fn role(&self) -> NodeRole {
        match self.role {
            RoleState::Follower => NodeRole::Follower,
            RoleState::Candidate(_) => NodeRole::Candidate,
            RoleState::Leader(_) => NodeRole::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader(_))
    }

    /// Known leader ID
    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    /// Known leader address
    pub fn leader_address(&self) -> Option<&str> {
        self.leader_address.as_deref()
    }

    pub fn commit_index(&self) -> Index {
        self.commit
    }

    pub fn last_index(&self) -> Index {
        self.log.last_index()
    }

    /// Index the next appended entry will get
    pub fn next_index(&self) -> Index {
        self.log.last_index() + 1
    }

    /// Committed voter configuration
    pub fn membership(&self) -> &ClusterMembership {
        &self.membership
    }

    /// Current voters
    pub fn voters(&self) -> Vec<NodeState> {
        self.membership.voters().cloned().collect()
    }

    /// State the driver must persist before replying
    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
            commit: self.commit,
        }
    }

    /// Drain queued peer messages
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Committed entries not yet handed to the apply loop, in order
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        if self.handed_off >= self.commit {
            return Vec::new();
        }
        let entries = self.log.range(self.handed_off + 1, self.commit);
        self.handed_off = self.commit;
        entries
    }

    /// Peers this node currently talks to, by ID and address
    pub fn peer_addresses(&self) -> Vec<(String, String)> {
        match &self.role {
            RoleState::Leader(leader) => leader
                .progress
                .iter()
                .map(|(id, p)| (id.clone(), p.address.clone()))
                .collect(),
            _ => self
                .membership
                .peers()
                .map(|n| (n.id.clone(), n.address.clone()))
                .collect(),
        }
    }

    /// Advance timers. Followers and candidates campaign once their
    /// election timeout expires; leaders heartbeat and check quorum.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        if self.is_leader() {
            return self.leader_tick(now);
        }

        if !self.timer.expired(now) {
            return Ok(());
        }

        if self.membership.is_self_voter() {
            self.campaign();
        } else {
            self.timer.reset();
        }
        Ok(())
    }

    /// Handle an inbound request and produce its reply
    pub fn step(&mut self, message: Message) -> Result<Message> {
        match message {
            Message::AppendEntries {
                term,
                leader_id,
                leader_address,
                prev_index,
                prev_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                leader_address,
                prev_index,
                prev_term,
                entries,
                leader_commit,
            ),
            Message::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => Ok(self.handle_request_vote(term, candidate_id, last_log_index, last_log_term)),
            other => Err(Error::Internal(format!(
                "Unexpected consensus request: {}",
                other.type_name()
            ))),
        }
    }

    /// Handle a peer's reply to one of our requests
    pub fn on_response(&mut self, from: &str, message: Message) -> Result<()> {
        match message {
            Message::AppendEntriesResponse {
                node_id,
                term,
                success,
                match_index,
                conflict_index,
            } => {
                if term > self.term {
                    self.become_follower(term, None, None);
                    return Ok(());
                }
                self.on_append_response(&node_id, term, success, match_index, conflict_index)
            }
            Message::VoteResponse {
                node_id,
                term,
                vote_granted,
            } => {
                self.on_vote_response(&node_id, term, vote_granted);
                Ok(())
            }
            Message::Error { message, .. } => {
                tracing::warn!("Peer {} returned error: {}", from, message);
                self.on_unreachable(from);
                Ok(())
            }
            other => {
                tracing::warn!("Unexpected response {} from {}", other.type_name(), from);
                Ok(())
            }
        }
    }

    /// A request to a peer failed without a reply
    pub fn on_unreachable(&mut self, peer: &str) {
        if let RoleState::Leader(leader) = &mut self.role {
            if let Some(progress) = leader.progress.get_mut(peer) {
                progress.inflight = false;
            }
        }
    }

    /// Step down (or stay down) as follower in `term`
    pub(super) fn become_follower(
        &mut self,
        term: Term,
        leader_id: Option<String>,
        leader_address: Option<String>,
    ) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }

        let was = self.role();
        if was != NodeRole::Follower || (leader_id.is_some() && self.leader_id != leader_id) {
            match &leader_id {
                Some(leader) => tracing::info!(
                    "Node {} following {} in term {}",
                    self.config.node_id,
                    leader,
                    self.term
                ),
                None if was == NodeRole::Leader => tracing::info!(
                    "Node {} stepping down as leader in term {}",
                    self.config.node_id,
                    self.term
                ),
                None => {}
            }
        }

        self.role = RoleState::Follower;
        self.leader_id = leader_id;
        self.leader_address = leader_address;
        if self.leader_id.is_none() {
            self.leader_contact = None;
        }
    }

    /// Start an election
    pub(super) fn campaign(&mut self) {
        self.term += 1;
        self.voted_for = Some(self.config.node_id.clone());
        self.leader_id = None;
        self.leader_address = None;
        self.leader_contact = None;
        self.timer.reset();
        self.role = RoleState::Candidate(Ballot::new(&self.config.node_id));

        tracing::info!(
            "Starting election for term {} (node: {})",
            self.term,
            self.config.node_id
        );

        let request = Message::RequestVote {
            term: self.term,
            candidate_id: self.config.node_id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let peers: Vec<(String, String)> = self
            .membership
            .peers()
            .map(|n| (n.id.clone(), n.address.clone()))
            .collect();
        for (to, address) in peers {
            self.outbox.push(Outbound {
                to,
                address,
                message: request.clone(),
            });
        }

        // A single voter wins immediately.
        self.check_ballot();
    }

    fn handle_request_vote(
        &mut self,
        term: Term,
        candidate_id: String,
        last_log_index: Index,
        last_log_term: Term,
    ) -> Message {
        // Ignore candidates while a live leader is known, so a partitioned
        // or removed node cannot force a new election.
        if term > self.term && self.leader_recently_seen(Instant::now()) {
            tracing::debug!(
                "Ignoring vote request from {} for term {}: leader is alive",
                candidate_id,
                term
            );
            return self.vote_reply(false);
        }

        if term < self.term {
            return self.vote_reply(false);
        }

        if term > self.term {
            self.become_follower(term, None, None);
        }

        let can_vote = match &self.voted_for {
            None => true,
            Some(id) => *id == candidate_id,
        };
        let up_to_date = log_is_up_to_date(
            last_log_term,
            last_log_index,
            self.log.last_term(),
            self.log.last_index(),
        );

        let granted = can_vote && up_to_date;
        if granted {
            self.voted_for = Some(candidate_id.clone());
            self.timer.reset();
            tracing::info!("Voted for {} in term {}", candidate_id, self.term);
        }
        self.vote_reply(granted)
    }

    fn vote_reply(&self, granted: bool) -> Message {
        Message::VoteResponse {
            node_id: self.config.node_id.clone(),
            term: self.term,
            vote_granted: granted,
        }
    }

    fn on_vote_response(&mut self, node_id: &str, term: Term, granted: bool) {
        if term > self.term {
            self.become_follower(term, None, None);
            return;
        }
        if term < self.term {
            return;
        }
        if let RoleState::Candidate(ballot) = &mut self.role {
            ballot.record(node_id, granted);
        }
        self.check_ballot();
    }

    fn check_ballot(&mut self) {
        let won = match &self.role {
            RoleState::Candidate(ballot) => {
                let granted =
                    ballot.granted_among(self.membership.voters().map(|n| n.id.as_str()));
                granted >= self.membership.quorum_size()
            }
            _ => false,
        };
        if won {
            self.become_leader();
        }
    }

    pub(super) fn leader_recently_seen(&self, now: Instant) -> bool {
        if self.is_leader() {
            return true;
        }
        match self.leader_contact {
            Some(at) => now.saturating_duration_since(at) < self.config.election.min_timeout(),
            None => false,
        }
    }

    /// Commit up to `index`, folding committed membership changes into the
    /// voter configuration.
    pub(super) fn advance_commit(&mut self, index: Index) {
        let index = index.min(self.log.last_index());
        if index <= self.commit {
            return;
        }

        for entry in self.log.range(self.commit + 1, index) {
            if let Some(change) = entry.membership() {
                self.membership.apply_change(change, entry.index);
                if matches!(&self.pending_change, Some((i, _)) if *i == entry.index) {
                    self.pending_change = None;
                }
                tracing::info!(
                    "Membership change committed at index {}: {} ({} voters)",
                    entry.index,
                    change,
                    self.membership.len()
                );
            }
        }
        self.commit = index;
        tracing::debug!("Commit index advanced to {}", index);

        if self.is_leader() {
            self.after_leader_commit();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wal::Command;
    use std::collections::BTreeMap;

    pub(crate) fn test_config(id: &str) -> RaftConfig {
        RaftConfig {
            node_id: id.to_string(),
            address: format!("addr-{}", id),
            election: ElectionConfig {
                timeout_min_ms: 150,
                timeout_max_ms: 300,
            },
            heartbeat_interval: Duration::from_millis(30),
            max_batch_entries: 2,
            reap_timeout: None,
        }
    }

    /// In-process cluster delivering messages synchronously
    pub(crate) struct TestCluster {
        pub nodes: BTreeMap<String, RaftNode>,
        pub down: Vec<String>,
    }

    impl TestCluster {
        /// A bootstrapped leader plus `followers` joined through it
        pub fn new(followers: &[&str]) -> Self {
            let mut nodes = BTreeMap::new();
            let n1 = RaftNode::new(
                test_config("n1"),
                LogStore::in_memory(),
                HardState::default(),
                true,
            )
            .unwrap();
            nodes.insert("n1".to_string(), n1);
            let mut cluster = Self {
                nodes,
                down: Vec::new(),
            };
            cluster.force_election("n1");

            for id in followers {
                let node = RaftNode::new(
                    test_config(id),
                    LogStore::in_memory(),
                    HardState::default(),
                    false,
                )
                .unwrap();
                cluster.nodes.insert(id.to_string(), node);
                let leader = cluster.leader().unwrap();
                cluster.propose(
                    &leader,
                    Payload::Membership(MembershipChange::AddNode {
                        id: id.to_string(),
                        address: format!("addr-{}", id),
                    }),
                )
                .unwrap();
                cluster.deliver();
            }
            cluster
        }

        pub fn node(&self, id: &str) -> &RaftNode {
            &self.nodes[id]
        }

        pub fn node_mut(&mut self, id: &str) -> &mut RaftNode {
            self.nodes.get_mut(id).unwrap()
        }

        pub fn leader(&self) -> Option<String> {
            self.nodes
                .iter()
                .filter(|(id, _)| !self.down.contains(id))
                .find(|(_, n)| n.is_leader())
                .map(|(id, _)| id.clone())
        }

        pub fn force_election(&mut self, id: &str) {
            self.node_mut(id).campaign();
            self.deliver();
        }

        pub fn propose(&mut self, id: &str, payload: Payload) -> Result<(Index, Term)> {
            let node = self.node_mut(id);
            node.check_proposal(&payload, Instant::now())?;
            node.append_proposal(payload)
        }

        pub fn command(&mut self, id: &str, sql: &str) -> Result<(Index, Term)> {
            self.propose(
                id,
                Payload::Command(Command::Execute {
                    connection: 1,
                    statements: vec![sql.to_string()],
                    transaction: false,
                }),
            )
        }

        /// Heartbeat round from the leader
        pub fn heartbeat(&mut self) {
            if let Some(leader) = self.leader() {
                let node = self.node_mut(&leader);
                node.broadcast_append();
                self.deliver();
            }
        }

        /// Deliver outboxes until quiet
        pub fn deliver(&mut self) {
            for _ in 0..1000 {
                let mut batch = Vec::new();
                for (id, node) in self.nodes.iter_mut() {
                    for out in node.take_outbox() {
                        batch.push((id.clone(), out));
                    }
                }
                if batch.is_empty() {
                    return;
                }
                for (from, out) in batch {
                    if self.down.contains(&from) {
                        continue;
                    }
                    if self.down.contains(&out.to) || !self.nodes.contains_key(&out.to) {
                        self.node_mut(&from).on_unreachable(&out.to);
                        continue;
                    }
                    let reply = self.node_mut(&out.to).step(out.message).unwrap();
                    self.node_mut(&from).on_response(&out.to, reply).unwrap();
                }
            }
            panic!("message storm");
        }
    }

    #[test]
    fn test_bootstrap_elects_single_voter() {
        let cluster = TestCluster::new(&[]);
        let n1 = cluster.node("n1");
        assert!(n1.is_leader());
        // Seed entry plus the leader's no-op
        assert_eq!(n1.commit_index(), 2);
        assert_eq!(n1.membership().voter_ids(), vec!["n1".to_string()]);
    }

    #[test]
    fn test_join_replicates_full_log() {
        let cluster = TestCluster::new(&["n2", "n3"]);
        let n1 = cluster.node("n1");
        assert_eq!(n1.membership().len(), 3);

        for id in ["n2", "n3"] {
            let node = cluster.node(id);
            assert_eq!(node.last_index(), n1.last_index());
            assert_eq!(node.leader_id(), Some("n1"));
        }
    }

    #[test]
    fn test_commit_reaches_followers_on_heartbeat() {
        let mut cluster = TestCluster::new(&["n2", "n3"]);
        let (index, _) = cluster.command("n1", "INSERT INTO foo VALUES(1)").unwrap();
        cluster.deliver();
        assert_eq!(cluster.node("n1").commit_index(), index);

        cluster.heartbeat();
        assert_eq!(cluster.node("n2").commit_index(), index);
        assert_eq!(cluster.node("n3").commit_index(), index);
    }

    #[test]
    fn test_vote_requires_up_to_date_log() {
        let mut cluster = TestCluster::new(&["n2", "n3"]);
        cluster.down.push("n3".into());
        cluster.command("n1", "INSERT INTO foo VALUES(1)").unwrap();
        cluster.deliver();
        cluster.down.clear();

        // n3 missed an entry, so n2 refuses it once the leader is gone.
        cluster.down.push("n1".into());
        cluster.node_mut("n2").leader_contact = None;
        let term = cluster.node("n3").term() + 1;
        let last_log_index = cluster.node("n3").last_index();
        let last_log_term = cluster.node("n3").log.last_term();
        let reply = cluster
            .node_mut("n2")
            .step(Message::RequestVote {
                term,
                candidate_id: "n3".into(),
                last_log_index,
                last_log_term,
            })
            .unwrap();
        match reply {
            Message::VoteResponse { vote_granted, .. } => assert!(!vote_granted),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_new_leader_after_leader_loss() {
        let mut cluster = TestCluster::new(&["n2", "n3"]);
        let (index, _) = cluster.command("n1", "INSERT INTO foo VALUES(1)").unwrap();
        cluster.deliver();
        cluster.heartbeat();

        cluster.down.push("n1".into());
        for id in ["n2", "n3"] {
            cluster.node_mut(id).leader_contact = None;
        }
        cluster.force_election("n2");

        assert_eq!(cluster.leader().as_deref(), Some("n2"));
        let n2 = cluster.node("n2");
        // The committed write survives and the new no-op commits on top of it.
        assert!(n2.commit_index() > index);
        assert_eq!(cluster.node("n3").leader_id(), Some("n2"));
    }

    #[test]
    fn test_higher_term_response_steps_leader_down() {
        let mut cluster = TestCluster::new(&["n2"]);
        let term = cluster.node("n1").term();
        cluster
            .node_mut("n1")
            .on_response(
                "n2",
                Message::AppendEntriesResponse {
                    node_id: "n2".into(),
                    term: term + 1,
                    success: false,
                    match_index: 0,
                    conflict_index: 0,
                },
            )
            .unwrap();
        let n1 = cluster.node("n1");
        assert!(!n1.is_leader());
        assert_eq!(n1.term(), term + 1);
        assert!(n1.hard_state().voted_for.is_none());
    }

    #[test]
    fn test_restart_restores_membership_from_log() {
        let cluster = TestCluster::new(&["n2"]);
        let n1 = cluster.node("n1");

        let mut log = LogStore::in_memory();
        log.append(&n1.log.range(1, n1.last_index())).unwrap();
        let restored = RaftNode::new(test_config("n1"), log, n1.hard_state(), true).unwrap();

        assert_eq!(restored.membership().voter_ids(), n1.membership().voter_ids());
        assert_eq!(restored.commit_index(), n1.commit_index());
        assert!(!restored.is_leader());
    }
}
