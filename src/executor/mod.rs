//! Database Executor Module
//!
//! Applies committed statement batches to the node-local SQLite database.

mod result;
mod sqlite;

pub use result::{
    ExecuteResponse, ExecuteResponseJson, QueryResponse, QueryResponseJson, StatementResult,
    StatementResultJson, Value,
};
pub use sqlite::{SqliteExecutor, READ_ONLY_VIOLATION};
