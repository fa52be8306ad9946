//! Replication Protocol
//!
//! Defines the wire protocol for communication between nodes. Every
//! exchange is a request followed by exactly one response on the same
//! TCP stream.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::executor::{ExecuteResponse, QueryResponse};
use crate::session::ConnectionInfo;
use crate::wal::{Index, LogEntry, Term};

use super::RaftStatus;

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Read consistency level for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Serve from whatever this node has applied
    None,
    /// Serve locally on the leader
    #[default]
    Weak,
    /// Send the query through the log
    Strong,
}

impl std::str::FromStr for ReadConsistency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ReadConsistency::None),
            "weak" => Ok(ReadConsistency::Weak),
            "strong" => Ok(ReadConsistency::Strong),
            other => Err(Error::Config(format!("unknown read consistency level '{}'", other))),
        }
    }
}

impl std::fmt::Display for ReadConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadConsistency::None => write!(f, "none"),
            ReadConsistency::Weak => write!(f, "weak"),
            ReadConsistency::Strong => write!(f, "strong"),
        }
    }
}

/// Client operations, served locally or forwarded to the leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Create a replicated connection
    Connect { client: String },

    /// Run a write batch on a connection
    Execute {
        connection: u64,
        statements: Vec<String>,
        transaction: bool,
    },

    /// Run a read batch on a connection
    Query {
        connection: u64,
        statements: Vec<String>,
        level: ReadConsistency,
    },

    /// Add a voter
    Join { node_id: String, address: String },

    /// Remove a voter
    Remove { node_id: String },
}

impl ClientRequest {
    /// Get the request name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientRequest::Connect { .. } => "Connect",
            ClientRequest::Execute { .. } => "Execute",
            ClientRequest::Query { .. } => "Query",
            ClientRequest::Join { .. } => "Join",
            ClientRequest::Remove { .. } => "Remove",
        }
    }
}

/// Successful results of client operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientReply {
    Connected(ConnectionInfo),
    Executed(ExecuteResponse),
    Queried(QueryResponse),
    /// Membership change committed at this index
    MembershipChanged { index: Index },
}

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Log Replication ==========
    /// Append entries request (from leader to followers), also the heartbeat
    AppendEntries {
        term: Term,
        leader_id: String,
        leader_address: String,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
    },

    /// Append entries response
    AppendEntriesResponse {
        node_id: String,
        term: Term,
        success: bool,
        /// Last index known to match the leader
        match_index: Index,
        /// Where the leader should resume on failure
        conflict_index: Index,
    },

    // ========== Leader Election ==========
    /// Request vote (from candidate)
    RequestVote {
        term: Term,
        candidate_id: String,
        last_log_index: Index,
        last_log_term: Term,
    },

    /// Vote response
    VoteResponse {
        node_id: String,
        term: Term,
        vote_granted: bool,
    },

    // ========== Client Forwarding ==========
    /// Client operation forwarded to (or sent directly at) a node
    ClientRequest {
        request: ClientRequest,
        /// Sent by a node that believes the receiver leads; never forwarded again
        forwarded: bool,
    },

    /// Result of a client operation
    ClientResponse { reply: ClientReply },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse { status: RaftStatus },

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
        /// Known leader, set with `NotLeader`
        leader: Option<String>,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Not the leader
    NotLeader,
    /// No leader known
    NoLeader,
    /// Leader cannot see a quorum
    Unavailable,
    /// Timeout
    Timeout,
    /// Membership change rejected
    JoinFailed,
    /// Connection ID not known
    UnknownConnection,
    /// Node not found
    NodeNotFound,
    /// Node is shutting down
    ShuttingDown,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Error response carrying a local error
    pub fn from_error(err: &Error) -> Self {
        let leader = match err {
            Error::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        Message::Error {
            code: err.code(),
            message: err.wire_message(),
            leader,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::AppendEntries { .. } => "AppendEntries",
            Message::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            Message::RequestVote { .. } => "RequestVote",
            Message::VoteResponse { .. } => "VoteResponse",
            Message::ClientRequest { .. } => "ClientRequest",
            Message::ClientResponse { .. } => "ClientResponse",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}

/// Codec framing [`Message`]s as `FrameHeader` + bincode payload
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = msg.serialize()?;
        if data.len() > MAX_FRAME_SIZE {
            return Err(Error::Network(format!("Message too large: {} bytes", data.len())));
        }
        let header = FrameHeader::new(&data);
        dst.reserve(FrameHeader::SIZE + data.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&data);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FrameHeader::SIZE];
        header.copy_from_slice(&src[..FrameHeader::SIZE]);
        let header = FrameHeader::from_bytes(&header);

        let length = header.length as usize;
        if length > MAX_FRAME_SIZE {
            return Err(Error::Network(format!("Message too large: {} bytes", length)));
        }

        if src.len() < FrameHeader::SIZE + length {
            src.reserve(FrameHeader::SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let data = src.split_to(length);
        if crc32fast::hash(&data) != header.checksum {
            return Err(Error::Network("Message checksum mismatch".into()));
        }

        Ok(Some(Message::deserialize(&data)?))
    }
}
