//! raftlite Error Types

use thiserror::Error;

use crate::replication::ErrorCode;

/// Result type alias for raftlite operations
pub type Result<T> = std::result::Result<T, Error>;

/// raftlite error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Log errors
    #[error("Log error: {0}")]
    Wal(String),

    #[error("Log entry corrupted at offset {offset}: {reason}")]
    WalCorrupted { offset: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // Consensus errors
    #[error("Not leader: current leader is {}", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("No leader available")]
    NoLeader,

    #[error("Quorum not reached: {reached}/{required}")]
    QuorumNotReached { reached: usize, required: usize },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Join failed: {0}")]
    JoinFailed(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is transient and the operation may be retried.
    ///
    /// Only errors that prove the request was never accepted qualify. A
    /// timeout or a connection dropped mid-request may hide a proposal that
    /// still commits, so those are never considered retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::NoLeader
                | Error::QuorumNotReached { .. }
                | Error::ConnectionFailed { .. }
        )
    }

    /// Check if this error points the caller at another node
    pub fn is_redirect(&self) -> bool {
        matches!(self, Error::NotLeader { leader: Some(_) })
    }

    /// Wire code used when this error crosses a node boundary
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotLeader { .. } => ErrorCode::NotLeader,
            Error::NoLeader => ErrorCode::NoLeader,
            Error::QuorumNotReached { .. } => ErrorCode::Unavailable,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::JoinFailed(_) => ErrorCode::JoinFailed,
            Error::UnknownConnection(_) => ErrorCode::UnknownConnection,
            Error::NodeNotFound(_) => ErrorCode::NodeNotFound,
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuild an error received from a peer
    pub fn from_wire(code: ErrorCode, message: String, leader: Option<String>) -> Self {
        match code {
            ErrorCode::NotLeader => Error::NotLeader { leader },
            ErrorCode::NoLeader => Error::NoLeader,
            ErrorCode::Unavailable => Error::QuorumNotReached { reached: 0, required: 0 },
            ErrorCode::Timeout => Error::Timeout(message),
            ErrorCode::JoinFailed => Error::JoinFailed(message),
            ErrorCode::UnknownConnection => {
                // The id is the only payload the peer sends for this code.
                match message.parse() {
                    Ok(id) => Error::UnknownConnection(id),
                    Err(_) => Error::Internal(message),
                }
            }
            ErrorCode::NodeNotFound => Error::NodeNotFound(message),
            ErrorCode::ShuttingDown => Error::ShuttingDown,
            ErrorCode::Internal => Error::Internal(message),
        }
    }

    /// Message text sent alongside the wire code
    pub fn wire_message(&self) -> String {
        match self {
            Error::UnknownConnection(id) => id.to_string(),
            Error::Timeout(msg)
            | Error::JoinFailed(msg)
            | Error::NodeNotFound(msg)
            | Error::Internal(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}
