//! Connection Registry
//!
//! Replicated client connections. A connection is created by a committed
//! log entry and its ID is that entry's index, so every node that applied
//! the entry knows the same connection.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::error::{Error, Result};
use crate::wal::{Index, Term};

/// Cluster-wide metadata of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection ID (the index of the creating entry)
    pub id: u64,
    /// Client label supplied at creation
    pub client: String,
    pub created_index: Index,
    pub created_term: Term,
    /// Timestamp assigned by the leader that created the entry
    pub created_at: DateTime<Utc>,
}

/// Connections known to this node
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u64, ConnectionInfo>>,
    /// Highest index applied locally
    applied: watch::Receiver<Index>,
}

impl ConnectionRegistry {
    pub fn new(applied: watch::Receiver<Index>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            applied,
        }
    }

    /// Record a connection from an applied creation entry
    pub async fn insert(&self, info: ConnectionInfo) {
        tracing::debug!("Connection {} created for client '{}'", info.id, info.client);
        self.connections.write().await.insert(info.id, info);
    }

    pub async fn get(&self, id: u64) -> Option<ConnectionInfo> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Look up a connection, waiting up to `timeout` for this node to
    /// apply its creation entry. Fails as soon as the entry's index has
    /// been applied without creating the connection.
    pub async fn wait_for(&self, id: u64, timeout: Duration) -> Result<ConnectionInfo> {
        let mut applied = self.applied.clone();
        let wait = async {
            loop {
                if let Some(info) = self.get(id).await {
                    return Ok(info);
                }
                if *applied.borrow_and_update() >= id {
                    return Err(Error::UnknownConnection(id));
                }
                if applied.changed().await.is_err() {
                    return Err(Error::ShuttingDown);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Connection {} not applied within {:?}", id, timeout);
                Err(Error::UnknownConnection(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u64) -> ConnectionInfo {
        ConnectionInfo {
            id,
            client: "test".into(),
            created_index: id,
            created_term: 1,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_wait_for_connection_applied_later() {
        let (tx, rx) = watch::channel(0);
        let registry = std::sync::Arc::new(ConnectionRegistry::new(rx));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for(5, Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.insert(info(5)).await;
        tx.send(5).unwrap();

        let found = waiter.await.unwrap().unwrap();
        assert_eq!(found.id, 5);
    }

    #[tokio::test]
    async fn test_applied_index_past_id_is_unknown() {
        let (_tx, rx) = watch::channel(10);
        let registry = ConnectionRegistry::new(rx);

        match registry.wait_for(7, Duration::from_secs(5)).await {
            Err(Error::UnknownConnection(id)) => assert_eq!(id, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (_tx, rx) = watch::channel(0);
        let registry = ConnectionRegistry::new(rx);

        let err = registry
            .wait_for(3, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownConnection(3)));
        assert!(registry.is_empty().await);
    }
}
