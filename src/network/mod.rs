//! Network Module
//!
//! Handles TCP communication between nodes. Each stream carries
//! `MessageCodec` frames in strict request/response order.

mod server;
mod client;

pub use server::NetworkServer;
pub use client::NetworkClient;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::replication::{Message, MessageCodec};

/// A framed peer connection
pub type FramedStream = Framed<TcpStream, MessageCodec>;

/// Handles requests arriving at the network server
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Produce the response to one request
    async fn handle(&self, peer: &str, message: Message) -> Message;
}

/// Read a framed message. A cleanly closed stream yields `None`.
pub async fn read_message(stream: &mut FramedStream) -> Result<Option<Message>> {
    stream.next().await.transpose()
}

/// Write a framed message
pub async fn write_message(stream: &mut FramedStream, message: Message) -> Result<()> {
    stream.send(message).await
}

/// Send a request and read its response
pub async fn round_trip(stream: &mut FramedStream, message: Message) -> Result<Message> {
    write_message(stream, message).await?;
    read_message(stream)
        .await?
        .ok_or_else(|| Error::Network("Connection closed before response".into()))
}
