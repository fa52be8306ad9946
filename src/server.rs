//! Node Assembly
//!
//! Wires the log, state tracker, executor, consensus engine, apply loop,
//! router and servers of one node together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::{AppState, HttpServer};
use crate::config::RaftliteConfig;
use crate::error::{Error, Result};
use crate::executor::SqliteExecutor;
use crate::network::{MessageHandler, NetworkClient, NetworkServer};
use crate::replication::{
    ApplyLoop, ClientReply, ClientRequest, Message, RaftConfig, RaftEngine, RaftHandle, RaftNode,
    RaftStatus, Waiters,
};
use crate::session::{ConnectionRegistry, RequestRouter};
use crate::state::StateTracker;
use crate::wal::{Index, LogStore};

/// Answers requests arriving over the cluster network
struct NodeHandler {
    raft: RaftHandle,
    router: Arc<RequestRouter>,
}

#[async_trait::async_trait]
impl MessageHandler for NodeHandler {
    async fn handle(&self, peer: &str, message: Message) -> Message {
        let result = match message {
            Message::AppendEntries { .. } | Message::RequestVote { .. } => {
                self.raft.step(message).await
            }
            Message::ClientRequest { request, forwarded } => {
                tracing::debug!("{} request from {}", request.type_name(), peer);
                let reply = if forwarded {
                    self.router.serve_local(&request).await
                } else {
                    self.router.route(request).await
                };
                reply.map(|reply| Message::ClientResponse { reply })
            }
            Message::StatusRequest => Ok(Message::StatusResponse {
                status: self.raft.status(),
            }),
            other => Err(Error::Network(format!(
                "unexpected {} request",
                other.type_name()
            ))),
        };
        result.unwrap_or_else(|e| Message::from_error(&e))
    }
}

/// A running node
pub struct RaftliteNode {
    id: String,
    address: String,
    raft: RaftHandle,
    router: Arc<RequestRouter>,
    registry: Arc<ConnectionRegistry>,
    client: NetworkClient,
    http_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    rpc_timeout: Duration,
    operation_timeout: Duration,
}

impl RaftliteNode {
    /// Start a node from its configuration. Nodes listed in `cluster.join`
    /// are asked to add this node once it is serving.
    pub async fn start(config: RaftliteConfig) -> Result<Self> {
        config.validate()?;
        let id = config.node.id.clone();

        std::fs::create_dir_all(config.data_dir())?;

        // Bind first so a port of 0 resolves to the address peers will use.
        let network = NetworkServer::bind(&config.node.bind_address).await?;
        let address = match &config.node.advertise_address {
            Some(address) => address.clone(),
            None => network.local_addr().to_string(),
        };

        let tracker = Arc::new(StateTracker::new(config.state_dir(), id.clone())?);
        let hard_state = tracker.hard_state().await?;
        let log = LogStore::open(&config.log_dir(), config.cluster.fsync)?;
        // The database is rebuilt from the log, so the last run's applied
        // index is only reported.
        let previously_applied = tracker.last_applied().await?;
        tracing::info!(
            "Node {} restored log to index {} (term {}, commit {}, previously applied {})",
            id,
            log.last_index(),
            hard_state.term,
            hard_state.commit,
            previously_applied
        );

        let node = RaftNode::new(
            RaftConfig::from_config(&config, address.clone()),
            log,
            hard_state.clone(),
            config.cluster.bootstrap,
        )?;

        let executor = Arc::new(SqliteExecutor::open(config.database.path.as_deref())?);
        let (applied_tx, applied_rx) = watch::channel(0);
        let (committed_tx, committed_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(applied_rx.clone()));
        let waiters = Arc::new(Waiters::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let apply = ApplyLoop::new(
            executor.clone(),
            registry.clone(),
            tracker.clone(),
            waiters.clone(),
            applied_tx,
        );
        tasks.push(tokio::spawn(apply.run(committed_rx)));

        let client = NetworkClient::new(config.rpc_timeout(), config.rpc_timeout());
        let (engine, raft) = RaftEngine::new(
            node,
            hard_state,
            tracker,
            client.clone(),
            waiters,
            committed_tx,
            applied_rx,
            config.heartbeat_interval(),
        );
        tasks.push(tokio::spawn(engine.run(shutdown_rx.clone())));

        let router = Arc::new(RequestRouter::new(
            raft.clone(),
            registry.clone(),
            executor,
            client.clone(),
            &config.router,
        ));

        let handler = Arc::new(NodeHandler {
            raft: raft.clone(),
            router: router.clone(),
        });
        let network_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = network.serve(handler, network_shutdown).await {
                tracing::error!("Network server error: {}", e);
            }
        }));

        let mut http_addr = None;
        if config.api.enabled {
            let state = Arc::new(AppState {
                node_id: id.clone(),
                router: router.clone(),
            });
            let http = HttpServer::bind(&config.api.bind_address, state).await?;
            http_addr = Some(http.local_addr());
            let http_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = http.serve(http_shutdown).await {
                    tracing::error!("HTTP server error: {}", e);
                }
            }));
        }

        tracing::info!("Node {} serving cluster traffic on {}", id, address);

        let node = Self {
            id,
            address,
            raft,
            router,
            registry,
            client,
            http_addr,
            shutdown,
            tasks,
            rpc_timeout: config.rpc_timeout(),
            operation_timeout: config.router.operation_timeout(),
        };

        if !config.cluster.join.is_empty() {
            node.join_cluster(&config.cluster.join).await?;
        }
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address peers reach this node at
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    pub fn router(&self) -> Arc<RequestRouter> {
        self.router.clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn status(&self) -> RaftStatus {
        self.raft.status()
    }

    /// Bound HTTP API address, if the API is enabled
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// State for building the HTTP router
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            node_id: self.id.clone(),
            router: self.router.clone(),
        })
    }

    /// Ask a member of an existing cluster to add this node as a voter.
    /// Targets are tried in order; the first acceptance wins.
    pub async fn join_cluster(&self, targets: &[String]) -> Result<Index> {
        let request = ClientRequest::Join {
            node_id: self.id.clone(),
            address: self.address.clone(),
        };
        let mut last_error = None;

        for target in targets.iter().filter(|t| **t != self.address) {
            tracing::info!("Node {} joining cluster via {}", self.id, target);
            let message = Message::ClientRequest {
                request: request.clone(),
                forwarded: false,
            };
            let wait = self.operation_timeout + self.rpc_timeout;
            match self.client.request_once(target, message, wait).await {
                Ok(Message::ClientResponse {
                    reply: ClientReply::MembershipChanged { index },
                }) => {
                    tracing::info!("Node {} joined cluster at index {}", self.id, index);
                    return Ok(index);
                }
                Ok(Message::Error {
                    code,
                    message,
                    leader,
                }) => last_error = Some(Error::from_wire(code, message, leader)),
                Ok(other) => {
                    last_error = Some(Error::Network(format!(
                        "unexpected {} in reply to join",
                        other.type_name()
                    )))
                }
                Err(e) => last_error = Some(e),
            }
        }

        let reason = match last_error {
            Some(Error::JoinFailed(reason)) => reason,
            Some(e) => e.to_string(),
            None => "no join target".to_string(),
        };
        tracing::warn!("Node {} failed to join cluster: {}", self.id, reason);
        Err(Error::JoinFailed(reason))
    }

    /// Stop all tasks and wait for them to finish
    pub async fn shutdown(self) {
        tracing::info!("Shutting down node {}", self.id);
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Task of node {} ended abnormally: {}", self.id, e);
            }
        }
        self.client.close_all().await;
    }

    /// Stop every task immediately, as a crash would
    pub fn kill(self) {
        tracing::info!("Killing node {}", self.id);
        for task in &self.tasks {
            task.abort();
        }
    }
}
