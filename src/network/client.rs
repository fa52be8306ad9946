//! Network Client
//!
//! TCP client for connecting to other nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::{round_trip, FramedStream};
use crate::error::{Error, Result};
use crate::replication::{Message, MessageCodec};

/// Network client for connecting to peer nodes
#[derive(Clone)]
pub struct NetworkClient {
    /// Connection pool: address -> connection
    pool: Arc<RwLock<HashMap<String, Arc<Mutex<FramedStream>>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message over a pooled connection and wait for the response.
    /// A dead pooled connection is replaced once.
    pub async fn request(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.request_inner(address, message)).await {
            Ok(result) => result,
            Err(_) => {
                // The stream may still carry the late response; drop it.
                self.remove_connection(address).await;
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    async fn request_inner(&self, address: &str, message: Message) -> Result<Message> {
        if let Some(entry) = self.get_connection(address).await {
            let mut stream = entry.lock().await;
            match round_trip(&mut stream, message.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed: {}", address, e);
                    drop(stream);
                    self.remove_connection(address).await;
                }
            }
        }

        let mut stream = self.connect(address).await?;
        let response = round_trip(&mut stream, message).await?;
        self.store_connection(address.to_string(), stream).await;
        Ok(response)
    }

    /// Send a message over a fresh connection. A failure to connect means
    /// the message was never sent and surfaces as `ConnectionFailed`; a
    /// response that does not arrive in time surfaces as
    /// `ConnectionTimeout`.
    pub async fn request_once(&self, address: &str, message: Message, wait: Duration) -> Result<Message> {
        let mut stream = self.connect(address).await?;
        match timeout(wait, round_trip(&mut stream, message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<FramedStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(Framed::new(stream, MessageCodec))
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "connect timed out".to_string(),
            }),
        }
    }

    /// Get a connection from the pool
    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<FramedStream>>> {
        let pool = self.pool.read().await;
        pool.get(address).cloned()
    }

    /// Store a connection in the pool
    async fn store_connection(&self, address: String, stream: FramedStream) {
        let mut pool = self.pool.write().await;
        pool.insert(address, Arc::new(Mutex::new(stream)));
    }

    /// Remove a connection from the pool
    async fn remove_connection(&self, address: &str) {
        let mut pool = self.pool.write().await;
        pool.remove(address);
    }

    /// Close all connections
    pub async fn close_all(&self) {
        self.pool.write().await.clear();
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}
