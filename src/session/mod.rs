//! Session Module
//!
//! Replicated client connections and the routing of client operations.

mod registry;
mod retry;
mod router;
mod connection;

pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use retry::{RetryPolicy, RetryState};
pub use router::RequestRouter;
pub use connection::Connection;
