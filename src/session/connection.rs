//! Client Connection
//!
//! A handle on a replicated connection. The ID stays valid on every node,
//! so a handle can be moved to another node when the one it was created
//! on goes away.

use std::sync::Arc;

use super::registry::ConnectionInfo;
use super::router::RequestRouter;
use crate::error::Result;
use crate::executor::{ExecuteResponse, QueryResponse};
use crate::replication::ReadConsistency;

/// A connection bound to the node that serves it
#[derive(Clone)]
pub struct Connection {
    info: ConnectionInfo,
    router: Arc<RequestRouter>,
}

impl Connection {
    /// Create a new replicated connection through `router`
    pub async fn open(router: Arc<RequestRouter>, client: &str) -> Result<Self> {
        let info = router.connect(client).await?;
        Ok(Self { info, router })
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Serve this connection through another node from now on
    pub fn reattach(&mut self, router: Arc<RequestRouter>) {
        tracing::debug!(
            "Connection {} reattached to node {}",
            self.info.id,
            router.raft().node_id()
        );
        self.router = router;
    }

    pub async fn execute(&self, statements: &[&str]) -> Result<ExecuteResponse> {
        self.router
            .execute(self.info.id, to_owned(statements), false)
            .await
    }

    /// Execute the batch atomically
    pub async fn execute_transaction(&self, statements: &[&str]) -> Result<ExecuteResponse> {
        self.router
            .execute(self.info.id, to_owned(statements), true)
            .await
    }

    pub async fn query(&self, statements: &[&str]) -> Result<QueryResponse> {
        self.query_with(statements, ReadConsistency::default()).await
    }

    pub async fn query_with(
        &self,
        statements: &[&str],
        level: ReadConsistency,
    ) -> Result<QueryResponse> {
        self.router
            .query(self.info.id, to_owned(statements), level)
            .await
    }
}

fn to_owned(statements: &[&str]) -> Vec<String> {
    statements.iter().map(|s| s.to_string()).collect()
}
