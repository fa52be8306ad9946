//! Statement Results
//!
//! Per-statement outcomes produced by the state machine. The types here are
//! carried over the wire with bincode, so their JSON rendering is provided
//! by separate view types that skip zero fields and keep field order.

use serde::{Deserialize, Serialize};

use crate::wal::{Index, Term};

/// SQL value read from a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// JSON form of the value. Blobs are hex encoded.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Blob(b) => serde_json::Value::String(hex::encode(b)),
        }
    }
}

impl From<rusqlite::types::ValueRef<'_>> for Value {
    fn from(value: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// Outcome of one statement in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatementResult {
    /// A statement that changed (or could have changed) the database
    Exec {
        last_insert_id: i64,
        rows_affected: u64,
    },
    /// A statement that returned rows
    Rows {
        columns: Vec<String>,
        /// Declared column types, empty for expressions
        types: Vec<String>,
        values: Vec<Vec<Value>>,
    },
    /// The statement failed
    Error { error: String },
}

impl StatementResult {
    pub fn error(message: impl Into<String>) -> Self {
        StatementResult::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StatementResult::Error { .. })
    }

    /// JSON view of this result
    pub fn json(&self) -> StatementResultJson<'_> {
        match self {
            StatementResult::Exec {
                last_insert_id,
                rows_affected,
            } => StatementResultJson::Exec {
                last_insert_id: *last_insert_id,
                rows_affected: *rows_affected,
            },
            StatementResult::Rows {
                columns,
                types,
                values,
            } => StatementResultJson::Rows {
                columns,
                types,
                values: values
                    .iter()
                    .map(|row| row.iter().map(Value::to_json).collect())
                    .collect(),
            },
            StatementResult::Error { error } => StatementResultJson::Error { error },
        }
    }
}

/// Result of an `Execute`, annotated with the entry that carried it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub results: Vec<StatementResult>,
    pub raft_term: Term,
    pub raft_idx: Index,
}

impl ExecuteResponse {
    pub fn json(&self) -> ExecuteResponseJson<'_> {
        ExecuteResponseJson {
            results: self.results.iter().map(StatementResult::json).collect(),
            raft_term: self.raft_term,
            raft_idx: self.raft_idx,
        }
    }

    /// Compact JSON text, e.g. `{"results":[{}],"raft_term":1,"raft_idx":8}`
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.json()).unwrap_or_default()
    }
}

/// Result of a `Query`. Carries no replication metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<StatementResult>,
}

impl QueryResponse {
    pub fn json(&self) -> QueryResponseJson<'_> {
        QueryResponseJson {
            results: self.results.iter().map(StatementResult::json).collect(),
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.json()).unwrap_or_default()
    }
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// JSON rendering of a [`StatementResult`]
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StatementResultJson<'a> {
    Exec {
        #[serde(skip_serializing_if = "is_zero_i64")]
        last_insert_id: i64,
        #[serde(skip_serializing_if = "is_zero_u64")]
        rows_affected: u64,
    },
    Rows {
        columns: &'a [String],
        types: &'a [String],
        values: Vec<Vec<serde_json::Value>>,
    },
    Error {
        error: &'a str,
    },
}

/// JSON rendering of an [`ExecuteResponse`]
#[derive(Debug, Serialize)]
pub struct ExecuteResponseJson<'a> {
    pub results: Vec<StatementResultJson<'a>>,
    pub raft_term: Term,
    pub raft_idx: Index,
}

/// JSON rendering of a [`QueryResponse`]
#[derive(Debug, Serialize)]
pub struct QueryResponseJson<'a> {
    pub results: Vec<StatementResultJson<'a>>,
}
