//! State Tracker
//!
//! Persistent storage for the Raft hard state (term, vote, commit index)
//! and the last index applied to the local database.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::wal::{Index, Term};

/// State that must reach disk before the node answers a peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<String>,
    pub commit: Index,
}

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Mutex<Connection>,
    /// Node ID
    node_id: String,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(data_dir: PathBuf, node_id: String) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("state.db");
        let conn = Connection::open(&db_path)?;
        Self::init(conn, node_id)
    }

    /// A tracker that forgets everything on drop
    pub fn in_memory(node_id: String) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, node_id)
    }

    fn init(conn: Connection, node_id: String) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            node_id,
        })
    }

    /// Load the hard state, defaulting to term 0 with no vote
    pub async fn hard_state(&self) -> Result<HardState> {
        let conn = self.conn.lock().await;
        Ok(HardState {
            term: read_int(&conn, "current_term")?,
            voted_for: read_text(&conn, "voted_for")?,
            commit: read_int(&conn, "commit_index")?,
        })
    }

    /// Persist the hard state atomically
    pub async fn save_hard_state(&self, state: &HardState) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        write_int(&tx, "current_term", state.term)?;
        write_int(&tx, "commit_index", state.commit)?;
        match &state.voted_for {
            Some(id) => {
                tx.execute(
                    r#"
                    INSERT INTO node_state (key, value_text) VALUES ('voted_for', ?1)
                    ON CONFLICT(key) DO UPDATE SET value_text = ?1, updated_at = CURRENT_TIMESTAMP
                    "#,
                    params![id],
                )?;
            }
            None => {
                tx.execute("DELETE FROM node_state WHERE key = 'voted_for'", [])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get the last applied index
    pub async fn last_applied(&self) -> Result<Index> {
        let conn = self.conn.lock().await;
        read_int(&conn, "last_applied")
    }

    /// Set the last applied index
    pub async fn set_last_applied(&self, index: Index) -> Result<()> {
        let conn = self.conn.lock().await;
        write_int(&conn, "last_applied", index)
    }

    /// Get node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

fn read_int(conn: &Connection, key: &str) -> Result<u64> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT value_int FROM node_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::State(format!("Failed to read {}: {}", key, e)))?;
    Ok(value.unwrap_or(0) as u64)
}

fn read_text(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value_text FROM node_state WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| Error::State(format!("Failed to read {}: {}", key, e)))
}

fn write_int(conn: &Connection, key: &str, value: u64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO node_state (key, value_int) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value_int = ?2, updated_at = CURRENT_TIMESTAMP
        "#,
        params![key, value as i64],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_hard_state_survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let tracker =
                StateTracker::new(dir.path().to_path_buf(), "node-1".to_string()).unwrap();
            assert_eq!(tracker.hard_state().await.unwrap(), HardState::default());

            tracker
                .save_hard_state(&HardState {
                    term: 4,
                    voted_for: Some("node-2".into()),
                    commit: 17,
                })
                .await
                .unwrap();
            tracker.set_last_applied(15).await.unwrap();
        }

        let tracker = StateTracker::new(dir.path().to_path_buf(), "node-1".to_string()).unwrap();
        let state = tracker.hard_state().await.unwrap();
        assert_eq!(state.term, 4);
        assert_eq!(state.voted_for.as_deref(), Some("node-2"));
        assert_eq!(state.commit, 17);
        assert_eq!(tracker.last_applied().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_clearing_vote() {
        let tracker = StateTracker::in_memory("node-1".to_string()).unwrap();

        let mut state = HardState {
            term: 2,
            voted_for: Some("node-1".into()),
            commit: 0,
        };
        tracker.save_hard_state(&state).await.unwrap();

        state.term = 3;
        state.voted_for = None;
        tracker.save_hard_state(&state).await.unwrap();

        let loaded = tracker.hard_state().await.unwrap();
        assert_eq!(loaded.term, 3);
        assert!(loaded.voted_for.is_none());
    }
}
