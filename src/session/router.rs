//! Request Router
//!
//! Decides where a client operation runs. Writes, connection creation,
//! membership changes and strong reads go through the log on the leader;
//! weak reads run on the leader without the log; reads at level `None`
//! run on whatever node received them. Operations that must reach the
//! leader are forwarded to it over a fresh connection.

use std::sync::Arc;
use std::time::Duration;

use super::registry::{ConnectionInfo, ConnectionRegistry};
use super::retry::{RetryPolicy, RetryState};
use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecuteResponse, QueryResponse, SqliteExecutor};
use crate::network::NetworkClient;
use crate::replication::{
    ApplyOutcome, ClientReply, ClientRequest, Committed, Message, RaftHandle, ReadConsistency,
};
use crate::wal::{Command, Index, MembershipChange, Payload};

/// Routes client operations to the node that can serve them
pub struct RequestRouter {
    raft: RaftHandle,
    registry: Arc<ConnectionRegistry>,
    executor: Arc<SqliteExecutor>,
    client: NetworkClient,
    policy: RetryPolicy,
    operation_timeout: Duration,
    catchup_timeout: Duration,
}

impl RequestRouter {
    pub fn new(
        raft: RaftHandle,
        registry: Arc<ConnectionRegistry>,
        executor: Arc<SqliteExecutor>,
        client: NetworkClient,
        config: &RouterConfig,
    ) -> Self {
        Self {
            raft,
            registry,
            executor,
            client,
            policy: RetryPolicy::from_config(config),
            operation_timeout: config.operation_timeout(),
            catchup_timeout: config.catchup_timeout(),
        }
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    /// Create a replicated connection
    pub async fn connect(&self, client: &str) -> Result<ConnectionInfo> {
        match self
            .route(ClientRequest::Connect {
                client: client.to_string(),
            })
            .await?
        {
            ClientReply::Connected(info) => Ok(info),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Run a write batch and report the entry that carried it
    pub async fn execute(
        &self,
        connection: u64,
        statements: Vec<String>,
        transaction: bool,
    ) -> Result<ExecuteResponse> {
        match self
            .route(ClientRequest::Execute {
                connection,
                statements,
                transaction,
            })
            .await?
        {
            ClientReply::Executed(response) => Ok(response),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Run a read batch at the given consistency level
    pub async fn query(
        &self,
        connection: u64,
        statements: Vec<String>,
        level: ReadConsistency,
    ) -> Result<QueryResponse> {
        match self
            .route(ClientRequest::Query {
                connection,
                statements,
                level,
            })
            .await?
        {
            ClientReply::Queried(response) => Ok(response),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Add a voter, returning the index at which it is a member
    pub async fn join(&self, node_id: &str, address: &str) -> Result<Index> {
        match self
            .route(ClientRequest::Join {
                node_id: node_id.to_string(),
                address: address.to_string(),
            })
            .await?
        {
            ClientReply::MembershipChanged { index } => Ok(index),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Remove a voter
    pub async fn remove(&self, node_id: &str) -> Result<Index> {
        match self
            .route(ClientRequest::Remove {
                node_id: node_id.to_string(),
            })
            .await?
        {
            ClientReply::MembershipChanged { index } => Ok(index),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Serve a request here or on the leader, retrying failures that prove
    /// the request was not accepted
    pub async fn route(&self, request: ClientRequest) -> Result<ClientReply> {
        let mut state = RetryState::default();
        let mut hint: Option<String> = None;

        loop {
            let error = match self.attempt(&request, hint.as_deref()).await {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            let delay = match self.policy.next_delay(&mut state, &error) {
                Some(delay) => delay,
                None => return Err(error),
            };
            tracing::debug!(
                "{} attempt {} failed ({}), retrying in {:?}",
                request.type_name(),
                state.attempt,
                error,
                delay
            );

            hint = match error {
                Error::NotLeader { leader } => leader,
                _ => None,
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn attempt(&self, request: &ClientRequest, hint: Option<&str>) -> Result<ClientReply> {
        let local_read = matches!(
            request,
            ClientRequest::Query {
                level: ReadConsistency::None,
                ..
            }
        );
        if local_read || self.raft.is_leader() {
            return self.serve_local(request).await;
        }

        let address = self.leader_address(hint)?;
        self.forward(&address, request).await
    }

    /// Address of the leader, preferring the one named by a redirect
    fn leader_address(&self, hint: Option<&str>) -> Result<String> {
        let status = self.raft.status();

        if let Some(id) = hint.filter(|id| *id != status.node_id) {
            if let Some(node) = status.voters.iter().find(|n| n.id == id) {
                return Ok(node.address.clone());
            }
        }

        match (status.leader_id, status.leader_address) {
            (Some(id), Some(address)) if id != status.node_id => Ok(address),
            _ => Err(Error::NoLeader),
        }
    }

    async fn forward(&self, address: &str, request: &ClientRequest) -> Result<ClientReply> {
        tracing::debug!("Forwarding {} to leader at {}", request.type_name(), address);
        let message = Message::ClientRequest {
            request: request.clone(),
            forwarded: true,
        };
        let wait = self.operation_timeout + self.catchup_timeout;

        match self.client.request_once(address, message, wait).await? {
            Message::ClientResponse { reply } => Ok(reply),
            Message::Error {
                code,
                message,
                leader,
            } => Err(Error::from_wire(code, message, leader)),
            other => Err(Error::Network(format!(
                "unexpected {} in reply to forwarded request",
                other.type_name()
            ))),
        }
    }

    /// Serve a request on this node without forwarding it anywhere
    pub async fn serve_local(&self, request: &ClientRequest) -> Result<ClientReply> {
        match request {
            ClientRequest::Connect { client } => {
                let done = self
                    .propose(Payload::Command(Command::CreateConnection {
                        client: client.clone(),
                    }))
                    .await?;
                match done.outcome {
                    ApplyOutcome::Connection(info) => Ok(ClientReply::Connected(info)),
                    other => Err(unexpected_outcome(&other)),
                }
            }
            ClientRequest::Execute {
                connection,
                statements,
                transaction,
            } => {
                self.registry
                    .wait_for(*connection, self.catchup_timeout)
                    .await?;
                let done = self
                    .propose(Payload::Command(Command::Execute {
                        connection: *connection,
                        statements: statements.clone(),
                        transaction: *transaction,
                    }))
                    .await?;
                match done.outcome {
                    ApplyOutcome::Executed(results) => Ok(ClientReply::Executed(ExecuteResponse {
                        results,
                        raft_term: done.term,
                        raft_idx: done.index,
                    })),
                    other => Err(unexpected_outcome(&other)),
                }
            }
            ClientRequest::Query {
                connection,
                statements,
                level,
            } => {
                self.registry
                    .wait_for(*connection, self.catchup_timeout)
                    .await?;
                self.query_local(*connection, statements, *level).await
            }
            ClientRequest::Join { node_id, address } => {
                let done = self
                    .propose(Payload::Membership(MembershipChange::AddNode {
                        id: node_id.clone(),
                        address: address.clone(),
                    }))
                    .await?;
                Ok(ClientReply::MembershipChanged { index: done.index })
            }
            ClientRequest::Remove { node_id } => {
                let done = self
                    .propose(Payload::Membership(MembershipChange::RemoveNode {
                        id: node_id.clone(),
                    }))
                    .await?;
                Ok(ClientReply::MembershipChanged { index: done.index })
            }
        }
    }

    async fn query_local(
        &self,
        connection: u64,
        statements: &[String],
        level: ReadConsistency,
    ) -> Result<ClientReply> {
        let results = match level {
            ReadConsistency::None => self.executor.query(statements).await?,
            ReadConsistency::Weak => {
                if !self.raft.is_leader() {
                    return Err(self.not_leader());
                }
                self.executor.query(statements).await?
            }
            ReadConsistency::Strong => {
                let done = self
                    .propose(Payload::Command(Command::Query {
                        connection,
                        statements: statements.to_vec(),
                    }))
                    .await?;
                match done.outcome {
                    ApplyOutcome::Queried(results) => results,
                    other => return Err(unexpected_outcome(&other)),
                }
            }
        };
        Ok(ClientReply::Queried(QueryResponse { results }))
    }

    async fn propose(&self, payload: Payload) -> Result<Committed> {
        self.raft
            .propose_and_wait(payload, self.operation_timeout)
            .await
    }

    fn not_leader(&self) -> Error {
        match self.raft.current_leader() {
            Some((id, _)) => Error::NotLeader { leader: Some(id) },
            None => Error::NoLeader,
        }
    }
}

fn unexpected_reply(reply: &ClientReply) -> Error {
    Error::Internal(format!("unexpected reply: {:?}", reply))
}

fn unexpected_outcome(outcome: &ApplyOutcome) -> Error {
    Error::Internal(format!("unexpected apply outcome: {:?}", outcome))
}
