//! Apply Loop
//!
//! Applies committed entries to the local database in index order and
//! hands results to the proposers waiting on them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::error::{Error, Result};
use crate::executor::{SqliteExecutor, StatementResult};
use crate::session::{ConnectionInfo, ConnectionRegistry};
use crate::state::StateTracker;
use crate::wal::{Command, Index, LogEntry, Payload, Term};

/// Result of applying one entry
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Connection(ConnectionInfo),
    Executed(Vec<StatementResult>),
    Queried(Vec<StatementResult>),
    Membership,
    Noop,
}

struct Waiter {
    term: Term,
    tx: oneshot::Sender<Result<ApplyOutcome>>,
}

/// Proposers waiting for their entry to apply, keyed by index
#[derive(Default)]
pub struct Waiters {
    inner: Mutex<HashMap<Index, Waiter>>,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the entry proposed at `index` in `term`
    pub async fn register(
        &self,
        index: Index,
        term: Term,
        tx: oneshot::Sender<Result<ApplyOutcome>>,
    ) {
        self.inner.lock().await.insert(index, Waiter { term, tx });
    }

    pub async fn remove(&self, index: Index) {
        self.inner.lock().await.remove(&index);
    }

    /// Whether someone waits on `index` for an entry of `term`
    async fn expects(&self, index: Index, term: Term) -> bool {
        self.inner
            .lock()
            .await
            .get(&index)
            .map(|w| w.term == term)
            .unwrap_or(false)
    }

    /// Deliver the outcome of the entry at `index`. A waiter registered for
    /// a different term lost its entry to a new leader.
    async fn complete(&self, entry: &LogEntry, outcome: Result<ApplyOutcome>) {
        let Some(waiter) = self.inner.lock().await.remove(&entry.index) else {
            return;
        };
        let result = if waiter.term == entry.term {
            outcome
        } else {
            tracing::debug!(
                "Entry {} was overwritten (term {} replaced term {})",
                entry.index,
                entry.term,
                waiter.term
            );
            Err(Error::NotLeader { leader: None })
        };
        // The proposer may have given up already.
        let _ = waiter.tx.send(result);
    }

    /// Fail every waiter, used on shutdown
    pub async fn fail_all(&self) {
        for (_, waiter) in self.inner.lock().await.drain() {
            let _ = waiter.tx.send(Err(Error::ShuttingDown));
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Consumes committed entries and applies them to the state machine
pub struct ApplyLoop {
    executor: Arc<SqliteExecutor>,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<StateTracker>,
    waiters: Arc<Waiters>,
    applied: watch::Sender<Index>,
}

impl ApplyLoop {
    pub fn new(
        executor: Arc<SqliteExecutor>,
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<StateTracker>,
        waiters: Arc<Waiters>,
        applied: watch::Sender<Index>,
    ) -> Self {
        Self {
            executor,
            registry,
            tracker,
            waiters,
            applied,
        }
    }

    /// Apply batches until the sending side closes
    pub async fn run(self, mut committed: mpsc::UnboundedReceiver<Vec<LogEntry>>) {
        while let Some(batch) = committed.recv().await {
            for entry in batch {
                if let Err(e) = self.apply_entry(&entry).await {
                    // The log is the source of truth; a node that cannot
                    // apply it must stop applying rather than diverge.
                    tracing::error!("Failed to apply entry {}: {}", entry.index, e);
                    self.waiters.fail_all().await;
                    return;
                }
            }
        }
        self.waiters.fail_all().await;
        tracing::debug!("Apply loop stopped at index {}", *self.applied.borrow());
    }

    /// Apply one entry. The entry must directly follow the last applied one.
    pub async fn apply_entry(&self, entry: &LogEntry) -> Result<()> {
        let last = *self.applied.borrow();
        if entry.index != last + 1 {
            return Err(Error::Internal(format!(
                "Entry {} applied out of order (last applied {})",
                entry.index, last
            )));
        }

        let outcome = self.apply(entry).await;
        if let Err(e) = &outcome {
            tracing::debug!("Entry {} failed: {}", entry.index, e);
        }

        self.tracker.set_last_applied(entry.index).await?;
        self.applied.send_replace(entry.index);
        self.waiters.complete(entry, outcome).await;
        Ok(())
    }

    async fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome> {
        match &entry.payload {
            Payload::Noop => Ok(ApplyOutcome::Noop),
            Payload::Membership(_) => Ok(ApplyOutcome::Membership),
            Payload::Command(Command::CreateConnection { client }) => {
                let info = ConnectionInfo {
                    id: entry.index,
                    client: client.clone(),
                    created_index: entry.index,
                    created_term: entry.term,
                    created_at: entry.timestamp,
                };
                self.registry.insert(info.clone()).await;
                Ok(ApplyOutcome::Connection(info))
            }
            Payload::Command(Command::Execute {
                connection,
                statements,
                transaction,
            }) => {
                self.require_connection(*connection).await?;
                let results = self.executor.execute(statements, *transaction).await?;
                Ok(ApplyOutcome::Executed(results))
            }
            Payload::Command(Command::Query {
                connection,
                statements,
            }) => {
                self.require_connection(*connection).await?;
                // Reads change nothing; only the proposer needs the answer.
                if !self.waiters.expects(entry.index, entry.term).await {
                    return Ok(ApplyOutcome::Noop);
                }
                let results = self.executor.query(statements).await?;
                Ok(ApplyOutcome::Queried(results))
            }
        }
    }

    async fn require_connection(&self, id: u64) -> Result<()> {
        match self.registry.get(id).await {
            Some(_) => Ok(()),
            None => Err(Error::UnknownConnection(id)),
        }
    }
}
