//! SQLite Executor
//!
//! Runs statement batches against the node-local SQLite database. Writes
//! arrive only from the apply loop; reads may come from request handlers.

use rusqlite::{Connection, Statement};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::result::{StatementResult, Value};
use crate::error::Result;

/// Message returned for a mutating statement sent as a query
pub const READ_ONLY_VIOLATION: &str = "attempt to change database via query operation";

/// SQLite state machine
pub struct SqliteExecutor {
    /// Database connection
    conn: Mutex<Connection>,
    /// Backing file, if any
    path: Option<PathBuf>,
}

impl SqliteExecutor {
    /// Open the database. An existing file is deleted first since the
    /// contents are rebuilt by replaying the log.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                for suffix in ["", "-wal", "-shm", "-journal"] {
                    let mut file = path.as_os_str().to_owned();
                    file.push(suffix);
                    match std::fs::remove_file(&file) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };

        tracing::debug!(
            "Opened SQLite database at {}",
            path.map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string())
        );

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.map(Path::to_path_buf),
        })
    }

    /// In-memory database
    pub fn in_memory() -> Result<Self> {
        Self::open(None)
    }

    /// Database file path, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Execute a statement batch. Statement failures are reported in the
    /// results; with `transaction` the batch stops and rolls back at the
    /// first failure.
    pub async fn execute(
        &self,
        statements: &[String],
        transaction: bool,
    ) -> Result<Vec<StatementResult>> {
        let mut conn = self.conn.lock().await;

        if !transaction {
            return Ok(statements
                .iter()
                .map(|sql| run_statement(&conn, sql, false))
                .collect());
        }

        let mut sp = conn.savepoint()?;
        let mut results = Vec::with_capacity(statements.len());
        let mut failed = false;
        for sql in statements {
            let result = run_statement(&sp, sql, false);
            failed = result.is_error();
            results.push(result);
            if failed {
                break;
            }
        }

        if failed {
            sp.rollback()?;
            sp.finish()?;
        } else {
            sp.commit()?;
        }
        Ok(results)
    }

    /// Run read-only statements. Mutating statements are rejected
    /// individually without touching the database.
    pub async fn query(&self, statements: &[String]) -> Result<Vec<StatementResult>> {
        let conn = self.conn.lock().await;
        Ok(statements
            .iter()
            .map(|sql| run_statement(&conn, sql, true))
            .collect())
    }
}

fn run_statement(conn: &Connection, sql: &str, read_only: bool) -> StatementResult {
    if sql.trim().is_empty() {
        return StatementResult::Exec {
            last_insert_id: 0,
            rows_affected: 0,
        };
    }

    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => return StatementResult::error(error_message(&e)),
    };

    // SQLite counts transaction control as read-only, but on the local
    // connection it would wrap or undo replicated writes on this node alone.
    if read_only && (!stmt.readonly() || is_transaction_control(sql)) {
        return StatementResult::error(READ_ONLY_VIOLATION);
    }

    let outcome = if stmt.column_count() > 0 {
        collect_rows(&mut stmt)
    } else {
        stmt.execute([]).map(|changed| StatementResult::Exec {
            last_insert_id: conn.last_insert_rowid(),
            rows_affected: changed as u64,
        })
    };

    outcome.unwrap_or_else(|e| StatementResult::error(error_message(&e)))
}

fn collect_rows(stmt: &mut Statement<'_>) -> rusqlite::Result<StatementResult> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let types: Vec<String> = stmt
        .columns()
        .iter()
        .map(|c| c.decl_type().unwrap_or("").to_ascii_lowercase())
        .collect();

    let count = columns.len();
    let mut values = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(Value::from(row.get_ref(i)?));
        }
        values.push(out);
    }

    Ok(StatementResult::Rows {
        columns,
        types,
        values,
    })
}

/// Leading keyword starts, ends or nests a transaction
fn is_transaction_control(sql: &str) -> bool {
    const KEYWORDS: [&str; 6] = ["BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE"];

    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(comment) = rest.strip_prefix("--") {
            rest = comment.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }

    let word: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(&word))
}

/// SQLite's own message, without rusqlite's wrapping
fn error_message(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
        rusqlite::Error::SqlInputError { msg, .. } => msg.clone(),
        other => other.to_string(),
    }
}
