//! Network Server
//!
//! TCP server for accepting connections from other nodes and clients.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use super::{read_message, write_message, MessageHandler};
use crate::error::Result;
use crate::replication::MessageCodec;

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bound listener
    listener: TcpListener,
    /// Actual local address (resolved when binding to port 0)
    local_addr: SocketAddr,
}

impl NetworkServer {
    /// Bind the listening socket
    pub async fn bind(bind_address: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown is signalled
    pub async fn serve(
        self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!("Network server listening on {}", self.local_addr);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = handler.clone();
                            let shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handler, shutdown).await {
                                    tracing::debug!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server on {} stopped", self.local_addr);
        Ok(())
    }
}

/// Serve requests on one connection, one at a time
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut stream = Framed::new(socket, MessageCodec);

    loop {
        let message = tokio::select! {
            message = read_message(&mut stream) => message?,
            _ = shutdown.changed() => break,
        };
        let Some(message) = message else {
            break;
        };

        tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
        let response = tokio::select! {
            response = handler.handle(peer_addr, message) => response,
            _ = shutdown.changed() => break,
        };
        write_message(&mut stream, response).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use crate::replication::Message;
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::StatusRequest => Message::Error {
                    code: crate::replication::ErrorCode::NoLeader,
                    message: "echo".into(),
                    leader: None,
                },
                other => other,
            }
        }
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let server = NetworkServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(server.serve(Arc::new(Echo), shutdown_rx));

        let client = NetworkClient::new(Duration::from_millis(500), Duration::from_secs(2));
        for _ in 0..3 {
            match client.request(&addr, Message::StatusRequest).await.unwrap() {
                Message::Error { message, .. } => assert_eq!(message, "echo"),
                other => panic!("unexpected {other:?}"),
            }
        }
        // The pooled connection was reused.
        assert_eq!(client.connection_count().await, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
