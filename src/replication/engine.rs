//! Consensus Engine
//!
//! Drives a `RaftNode` from a single task: timer ticks, inbound requests,
//! peer replies and proposals all arrive as events. After every event the
//! engine persists the hard state, then releases replies and peer
//! messages, hands committed entries to the apply loop and publishes the
//! node status on a watch channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::apply::{ApplyOutcome, Waiters};
use super::leader::ProposalCheck;
use super::node::{Outbound, RaftNode};
use super::protocol::Message;
use crate::error::{Error, Result};
use crate::network::NetworkClient;
use crate::state::{HardState, NodeRole, NodeState, StateTracker};
use crate::wal::{Index, LogEntry, Payload, Term};

const EVENT_QUEUE: usize = 1024;

/// Observable consensus state of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub node_id: String,
    pub address: String,
    pub role: NodeRole,
    pub term: Term,
    pub leader_id: Option<String>,
    pub leader_address: Option<String>,
    pub commit_index: Index,
    pub last_index: Index,
    pub applied_index: Index,
    pub voters: Vec<NodeState>,
}

impl RaftStatus {
    fn of(node: &RaftNode) -> Self {
        Self {
            node_id: node.id().to_string(),
            address: node.address().to_string(),
            role: node.role(),
            term: node.term(),
            leader_id: node.leader_id().map(str::to_string),
            leader_address: node.leader_address().map(str::to_string),
            commit_index: node.commit_index(),
            last_index: node.last_index(),
            applied_index: 0,
            voters: node.voters(),
        }
    }
}

/// How a proposal was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    /// Appended to the leader's log
    Appended { index: Index, term: Term },
    /// A membership change already in effect as of `index`
    AlreadyApplied { index: Index },
}

/// An applied proposal
#[derive(Debug, Clone)]
pub struct Committed {
    pub index: Index,
    pub term: Term,
    pub outcome: ApplyOutcome,
}

/// Input to the consensus task
pub(crate) enum Event {
    Inbound {
        message: Message,
        reply: oneshot::Sender<Result<Message>>,
    },
    Response {
        from: String,
        message: Message,
    },
    Unreachable {
        peer: String,
    },
    Propose {
        payload: Payload,
        waiter: Option<oneshot::Sender<Result<ApplyOutcome>>>,
        reply: oneshot::Sender<Result<Proposal>>,
    },
}

/// Reply held back until the hard state is durable
enum PendingReply {
    Inbound(oneshot::Sender<Result<Message>>, Result<Message>),
    Proposal(oneshot::Sender<Result<Proposal>>, Result<Proposal>),
}

impl PendingReply {
    fn send(self) {
        // Requesters that went away no longer care.
        match self {
            PendingReply::Inbound(tx, result) => {
                let _ = tx.send(result);
            }
            PendingReply::Proposal(tx, result) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// Replication sender for one peer
struct PeerSender {
    address: String,
    tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// The consensus task
pub struct RaftEngine {
    node: RaftNode,
    tracker: Arc<StateTracker>,
    client: NetworkClient,
    waiters: Arc<Waiters>,
    events_tx: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
    committed: mpsc::UnboundedSender<Vec<LogEntry>>,
    status: watch::Sender<RaftStatus>,
    senders: HashMap<String, PeerSender>,
    persisted: HardState,
    heartbeat_interval: Duration,
}

impl RaftEngine {
    /// Wrap a restored node. `persisted` is the hard state already on disk.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: RaftNode,
        persisted: HardState,
        tracker: Arc<StateTracker>,
        client: NetworkClient,
        waiters: Arc<Waiters>,
        committed: mpsc::UnboundedSender<Vec<LogEntry>>,
        applied: watch::Receiver<Index>,
        heartbeat_interval: Duration,
    ) -> (Self, RaftHandle) {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (status, status_rx) = watch::channel(RaftStatus::of(&node));

        let handle = RaftHandle {
            node_id: node.id().to_string(),
            events: events_tx.clone(),
            status: status_rx,
            applied,
        };
        let engine = Self {
            node,
            tracker,
            client,
            waiters,
            events_tx,
            events,
            committed,
            status,
            senders: HashMap::new(),
            persisted,
            heartbeat_interval,
        };
        (engine, handle)
    }

    /// Run until shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = (self.heartbeat_interval / 2).max(Duration::from_millis(5));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Consensus engine started for node {} (term {}, commit {})",
            self.node.id(),
            self.node.term(),
            self.node.commit_index()
        );

        // Entries committed before a restart are replayed right away.
        self.flush(Vec::new()).await;

        loop {
            let mut replies = Vec::new();
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.node.tick(Instant::now()) {
                        tracing::error!("Tick failed on node {}: {}", self.node.id(), e);
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event, &mut replies).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
            self.flush(replies).await;
        }

        for (_, sender) in self.senders.drain() {
            sender.task.abort();
        }
        self.waiters.fail_all().await;
        tracing::info!("Consensus engine for node {} stopped", self.node.id());
    }

    async fn handle_event(&mut self, event: Event, replies: &mut Vec<PendingReply>) {
        match event {
            Event::Inbound { message, reply } => {
                let result = self.node.step(message);
                if let Err(e) = &result {
                    tracing::warn!("Rejected consensus request: {}", e);
                }
                replies.push(PendingReply::Inbound(reply, result));
            }
            Event::Response { from, message } => {
                if let Err(e) = self.node.on_response(&from, message) {
                    tracing::error!("Failed to handle response from {}: {}", from, e);
                }
            }
            Event::Unreachable { peer } => self.node.on_unreachable(&peer),
            Event::Propose {
                payload,
                waiter,
                reply,
            } => {
                let result = self.propose(payload, waiter).await;
                replies.push(PendingReply::Proposal(reply, result));
            }
        }
    }

    async fn propose(
        &mut self,
        payload: Payload,
        waiter: Option<oneshot::Sender<Result<ApplyOutcome>>>,
    ) -> Result<Proposal> {
        match self.node.check_proposal(&payload, Instant::now())? {
            ProposalCheck::AlreadyApplied => Ok(Proposal::AlreadyApplied {
                index: self.node.commit_index(),
            }),
            ProposalCheck::Ready => {
                // Registered first: a single voter commits inside the append.
                let index = self.node.next_index();
                if let Some(tx) = waiter {
                    self.waiters.register(index, self.node.term(), tx).await;
                }
                match self.node.append_proposal(payload) {
                    Ok((index, term)) => Ok(Proposal::Appended { index, term }),
                    Err(e) => {
                        self.waiters.remove(index).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Persist, then let everything the last event produced leave the node
    async fn flush(&mut self, replies: Vec<PendingReply>) {
        let hard_state = self.node.hard_state();
        if hard_state != self.persisted {
            if let Err(e) = self.tracker.save_hard_state(&hard_state).await {
                tracing::error!("Failed to persist hard state: {}", e);
                // Nothing may leave the node on the strength of unsaved state.
                self.node.take_outbox();
                return;
            }
            self.persisted = hard_state;
        }

        for reply in replies {
            reply.send();
        }

        for outbound in self.node.take_outbox() {
            self.dispatch(outbound);
        }

        let committed = self.node.take_committed();
        if !committed.is_empty() && self.committed.send(committed).is_err() {
            tracing::warn!("Apply loop has stopped; committed entries dropped");
        }

        self.sync_senders();
        self.publish_status();
    }

    fn dispatch(&mut self, outbound: Outbound) {
        let Outbound {
            to,
            address,
            message,
        } = outbound;
        let sender = self.sender_for(&to, &address);
        if sender.tx.send(message).is_err() {
            tracing::warn!("Sender for peer {} is gone", to);
            self.senders.remove(&to);
            self.node.on_unreachable(&to);
        }
    }

    fn sender_for(&mut self, peer: &str, address: &str) -> &PeerSender {
        let stale = self
            .senders
            .get(peer)
            .map(|s| s.address != address)
            .unwrap_or(true);
        if stale {
            if let Some(old) = self.senders.remove(peer) {
                old.task.abort();
            }
            let sender = self.spawn_sender(peer.to_string(), address.to_string());
            self.senders.insert(peer.to_string(), sender);
        }
        &self.senders[peer]
    }

    fn spawn_sender(&self, peer: String, address: String) -> PeerSender {
        tracing::debug!("Starting replication sender for {} at {}", peer, address);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(peer_sender(
            peer,
            address.clone(),
            self.client.clone(),
            rx,
            self.events_tx.clone(),
        ));
        PeerSender { address, tx, task }
    }

    /// Stop senders for nodes that are no longer peers
    fn sync_senders(&mut self) {
        let peers: HashMap<String, String> = self.node.peer_addresses().into_iter().collect();
        self.senders.retain(|id, sender| {
            let keep = peers.get(id) == Some(&sender.address);
            if !keep {
                tracing::debug!("Stopping replication sender for {}", id);
                sender.task.abort();
            }
            keep
        });
    }

    fn publish_status(&self) {
        let status = RaftStatus::of(&self.node);
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Deliver messages to one peer in order, feeding replies back as events
async fn peer_sender(
    peer: String,
    address: String,
    client: NetworkClient,
    mut rx: mpsc::UnboundedReceiver<Message>,
    events: mpsc::Sender<Event>,
) {
    while let Some(message) = rx.recv().await {
        let event = match client.request(&address, message).await {
            Ok(message) => Event::Response {
                from: peer.clone(),
                message,
            },
            Err(e) => {
                tracing::debug!("Peer {} at {} unreachable: {}", peer, address, e);
                Event::Unreachable { peer: peer.clone() }
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}

/// Cloneable access to a running consensus engine
#[derive(Clone)]
pub struct RaftHandle {
    node_id: String,
    events: mpsc::Sender<Event>,
    status: watch::Receiver<RaftStatus>,
    applied: watch::Receiver<Index>,
}

impl RaftHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Propose an entry without waiting for it to apply
    pub async fn propose(&self, payload: Payload) -> Result<Proposal> {
        self.send_proposal(payload, None).await
    }

    /// Propose an entry and wait until it is applied locally
    pub async fn propose_and_wait(&self, payload: Payload, timeout: Duration) -> Result<Committed> {
        let (tx, rx) = oneshot::channel();
        let wait = async {
            match self.send_proposal(payload, Some(tx)).await? {
                Proposal::AlreadyApplied { index } => Ok(Committed {
                    index,
                    term: self.status().term,
                    outcome: ApplyOutcome::Membership,
                }),
                Proposal::Appended { index, term } => {
                    let outcome = rx.await.map_err(|_| Error::ShuttingDown)??;
                    Ok(Committed {
                        index,
                        term,
                        outcome,
                    })
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "proposal not applied within {:?}",
                timeout
            ))),
        }
    }

    async fn send_proposal(
        &self,
        payload: Payload,
        waiter: Option<oneshot::Sender<Result<ApplyOutcome>>>,
    ) -> Result<Proposal> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Propose {
                payload,
                waiter,
                reply,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Hand an inbound consensus request to the engine
    pub async fn step(&self, message: Message) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Inbound { message, reply })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Latest published status
    pub fn status(&self) -> RaftStatus {
        let mut status = self.status.borrow().clone();
        status.applied_index = *self.applied.borrow();
        status
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == NodeRole::Leader
    }

    /// Known leader as (ID, address)
    pub fn current_leader(&self) -> Option<(String, String)> {
        let status = self.status.borrow();
        match (&status.leader_id, &status.leader_address) {
            (Some(id), Some(address)) => Some((id.clone(), address.clone())),
            _ => None,
        }
    }

    pub fn applied_index(&self) -> Index {
        *self.applied.borrow()
    }

    /// Wait until some leader is known
    pub async fn await_leader(&self, timeout: Duration) -> Result<String> {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                if let Some(leader) = status.borrow_and_update().leader_id.clone() {
                    return Ok(leader);
                }
                status.changed().await.map_err(|_| Error::ShuttingDown)?;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("no leader within {:?}", timeout))),
        }
    }

    /// Wait until this node has applied `index`
    pub async fn wait_applied(&self, index: Index, timeout: Duration) -> Result<()> {
        let mut applied = self.applied.clone();
        let waited = tokio::time::timeout(timeout, applied.wait_for(|applied| *applied >= index))
            .await
            .map(|reached| reached.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => Err(Error::Timeout(format!(
                "index {} not applied within {:?}",
                index, timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SqliteExecutor;
    use crate::replication::node::tests::test_config;
    use crate::replication::ApplyLoop;
    use crate::session::ConnectionRegistry;
    use crate::wal::{Command, LogStore};

    struct SingleNode {
        handle: RaftHandle,
        tracker: Arc<StateTracker>,
        shutdown: watch::Sender<bool>,
    }

    fn single_node() -> SingleNode {
        let tracker = Arc::new(StateTracker::in_memory("n1".into()).unwrap());
        let node = RaftNode::new(
            test_config("n1"),
            LogStore::in_memory(),
            HardState::default(),
            true,
        )
        .unwrap();
        let (applied_tx, applied_rx) = watch::channel(0);
        let (committed_tx, committed_rx) = mpsc::unbounded_channel();
        let waiters = Arc::new(Waiters::new());
        let registry = Arc::new(ConnectionRegistry::new(applied_rx.clone()));

        let apply = ApplyLoop::new(
            Arc::new(SqliteExecutor::in_memory().unwrap()),
            registry,
            tracker.clone(),
            waiters.clone(),
            applied_tx,
        );
        tokio::spawn(apply.run(committed_rx));

        let (engine, handle) = RaftEngine::new(
            node,
            HardState::default(),
            tracker.clone(),
            NetworkClient::new(Duration::from_millis(100), Duration::from_millis(200)),
            waiters,
            committed_tx,
            applied_rx,
            Duration::from_millis(30),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(engine.run(shutdown_rx));

        SingleNode {
            handle,
            tracker,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let node = single_node();
        let leader = node.handle.await_leader(Duration::from_secs(3)).await.unwrap();
        assert_eq!(leader, "n1");
        assert!(node.handle.is_leader());

        // The vote reached disk before leadership was published.
        let hard = node.tracker.hard_state().await.unwrap();
        assert_eq!(hard.voted_for.as_deref(), Some("n1"));
        assert!(hard.term >= 2);
        node.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_proposals_apply_in_order() {
        let node = single_node();
        node.handle.await_leader(Duration::from_secs(3)).await.unwrap();

        let created = node
            .handle
            .propose_and_wait(
                Payload::Command(Command::CreateConnection { client: "t".into() }),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        let id = match created.outcome {
            ApplyOutcome::Connection(info) => info.id,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(id, created.index);

        let mut last = created.index;
        for sql in [
            "CREATE TABLE foo (id INTEGER PRIMARY KEY, name TEXT)",
            "INSERT INTO foo(name) VALUES('fiona')",
        ] {
            let done = node
                .handle
                .propose_and_wait(
                    Payload::Command(Command::Execute {
                        connection: id,
                        statements: vec![sql.into()],
                        transaction: false,
                    }),
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            assert!(done.index > last);
            last = done.index;
        }

        node.handle.wait_applied(last, Duration::from_secs(1)).await.unwrap();
        assert_eq!(node.handle.status().applied_index, last);
        node.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let tracker = Arc::new(StateTracker::in_memory("n2".into()).unwrap());
        let node = RaftNode::new(
            test_config("n2"),
            LogStore::in_memory(),
            HardState::default(),
            false,
        )
        .unwrap();
        let (_applied_tx, applied_rx) = watch::channel(0);
        let (committed_tx, _committed_rx) = mpsc::unbounded_channel();
        let (engine, handle) = RaftEngine::new(
            node,
            HardState::default(),
            tracker,
            NetworkClient::new(Duration::from_millis(100), Duration::from_millis(200)),
            Arc::new(Waiters::new()),
            committed_tx,
            applied_rx,
            Duration::from_millis(30),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(engine.run(shutdown_rx));

        let err = handle.propose(Payload::Noop).await.unwrap_err();
        assert!(matches!(err, Error::NoLeader));
        assert!(handle.await_leader(Duration::from_millis(100)).await.is_err());
        shutdown.send(true).unwrap();
    }
}
