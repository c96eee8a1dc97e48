//! Transactions, savepoints and the registry of active transactions.
//!
//! A [`Transaction`] borrows its connection mutably for its whole lifetime, so
//! only one transaction can run on a connection at a time and it cannot be
//! shared between tasks. Statements issued through it are tracked so that an
//! error which aborts the whole transaction makes every later statement fail
//! fast until the caller rolls back.

use crate::db::connection::Connection;
use crate::db::dialect::validate_identifier;
use crate::db::driver::DriverError;
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionId, Dialect, IsolationLevel, QueryParam, QueryResult, SavepointFrame, TransactionMetadata,
    TransactionState,
};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct ActiveTransaction {
    connection_id: ConnectionId,
    isolation_level: IsolationLevel,
    started_at: DateTime<Utc>,
    started: Instant,
}

type Registry = Arc<Mutex<HashMap<String, ActiveTransaction>>>;

/// Issues transactions and keeps track of the ones still active.
///
/// Cloning is cheap; clones share one registry.
#[derive(Clone, Default)]
pub struct TransactionManager {
    transactions: Registry,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction on `conn` at `isolation`.
    ///
    /// Fails with [`DbError::Transaction`] if the connection already has an open
    /// transaction or the database rejects the isolation level.
    pub async fn begin<'c>(
        &self,
        conn: &'c mut Connection,
        isolation: IsolationLevel,
    ) -> DbResult<Transaction<'c>> {
        if conn.in_transaction() {
            let existing = self
                .transaction_on(conn.id())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(DbError::transaction(
                format!("Connection {} already has an active transaction", conn.id()),
                existing,
            ));
        }
        if !conn.is_connected() {
            return Err(DbError::connection(
                "Cannot begin a transaction on a closed or broken connection",
                conn.id().to_string(),
            ));
        }

        let transaction_id = generate_transaction_id();
        for sql in conn.dialect().begin_statements(isolation) {
            if let Err(e) = conn.run(&sql, &[]).await {
                if e.is_connection() {
                    return Err(DbError::from_driver(e, conn.id().to_string()));
                }
                return Err(DbError::transaction(
                    format!("Failed to begin transaction at {}: {}", isolation, e),
                    transaction_id,
                ));
            }
        }
        conn.set_in_transaction(true);

        self.transactions.lock().insert(
            transaction_id.clone(),
            ActiveTransaction {
                connection_id: conn.id(),
                isolation_level: isolation,
                started_at: Utc::now(),
                started: Instant::now(),
            },
        );

        info!(
            transaction_id = %transaction_id,
            connection_id = %conn.id(),
            isolation = %isolation,
            "Transaction started"
        );

        Ok(Transaction {
            id: transaction_id,
            conn,
            isolation,
            state: TransactionState::Active,
            savepoints: Vec::new(),
            aborted: None,
            registry: Arc::clone(&self.transactions),
        })
    }

    /// Run `f` inside a transaction: commit if it returns `Ok`, roll back if it
    /// returns `Err` or leaves the transaction unusable.
    ///
    /// ```ignore
    /// let count = manager
    ///     .with_transaction(&mut conn, IsolationLevel::ReadCommitted, |tx| {
    ///         Box::pin(async move {
    ///             tx.execute("INSERT INTO audit (event) VALUES ('login')", &[]).await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, F>(
        &self,
        conn: &mut Connection,
        isolation: IsolationLevel,
        f: F,
    ) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction<'_>) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut tx = self.begin(conn, isolation).await?;
        let result = f(&mut tx).await;

        if !tx.state().is_active() {
            return match result {
                Ok(_) => Err(DbError::invalid_state(
                    "commit",
                    tx.id().to_string(),
                    tx.state(),
                )),
                Err(e) => Err(e),
            };
        }

        match result {
            Ok(value) => {
                if tx.is_aborted() {
                    let err = tx.aborted_error();
                    tx.rollback().await?;
                    return Err(err);
                }
                tx.release_all_savepoints().await?;
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        transaction_id = %tx.id(),
                        error = %rollback_err,
                        "Rollback after failed unit of work also failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Metadata of every transaction begun through this manager and not yet ended.
    pub fn list_active(&self) -> Vec<TransactionMetadata> {
        let txs = self.transactions.lock();
        txs.iter()
            .map(|(id, entry)| TransactionMetadata {
                transaction_id: id.clone(),
                connection_id: entry.connection_id.to_string(),
                isolation_level: entry.isolation_level,
                started_at: entry.started_at,
                duration_secs: entry.started.elapsed().as_secs(),
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.transactions.lock().len()
    }

    fn transaction_on(&self, connection_id: ConnectionId) -> Option<String> {
        self.transactions
            .lock()
            .iter()
            .find(|(_, entry)| entry.connection_id == connection_id)
            .map(|(id, _)| id.clone())
    }
}

/// An open transaction on a borrowed connection.
///
/// End it with [`commit`](Self::commit) or [`rollback`](Self::rollback). A
/// transaction dropped while still active leaves its connection flagged as
/// inside a transaction, so a pool discards it instead of reusing it.
pub struct Transaction<'c> {
    id: String,
    conn: &'c mut Connection,
    isolation: IsolationLevel,
    state: TransactionState,
    savepoints: Vec<SavepointFrame>,
    /// Set when a statement error aborted the whole transaction
    aborted: Option<String>,
    registry: Registry,
}

impl<'c> Transaction<'c> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Open savepoints, outermost first.
    pub fn savepoints(&self) -> &[SavepointFrame] {
        &self.savepoints
    }

    pub fn depth(&self) -> usize {
        self.savepoints.len()
    }

    /// True after an error that requires a rollback before more statements can run.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.ensure_usable("execute")?;
        match self.conn.run(sql, params).await {
            Ok(affected) => {
                debug!(transaction_id = %self.id, rows_affected = affected, "Executed in transaction");
                Ok(affected)
            }
            Err(e) => Err(self.statement_failed(e)),
        }
    }

    /// Run a query inside the transaction and collect its rows.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.ensure_usable("query")?;
        match self.conn.fetch(sql, params).await {
            Ok(rows) => {
                debug!(transaction_id = %self.id, row_count = rows.len(), "Queried in transaction");
                Ok(QueryResult::new(rows))
            }
            Err(e) => Err(self.statement_failed(e)),
        }
    }

    /// Push a savepoint named `name`.
    ///
    /// The name must be an identifier not already on the stack.
    pub async fn savepoint(&mut self, name: &str) -> DbResult<SavepointFrame> {
        self.ensure_usable("savepoint")?;
        validate_identifier("Savepoint name", name)?;
        if self.savepoints.iter().any(|frame| frame.name == name) {
            return Err(DbError::transaction(
                format!("Savepoint '{}' is already active", name),
                self.id.clone(),
            ));
        }

        let sql = self.conn.dialect().savepoint_statement(name);
        if let Err(e) = self.conn.run(&sql, &[]).await {
            return Err(self.statement_failed(e));
        }

        let frame = SavepointFrame {
            name: name.to_string(),
            depth: self.savepoints.len() + 1,
        };
        self.savepoints.push(frame.clone());
        debug!(transaction_id = %self.id, savepoint = name, depth = frame.depth, "Savepoint created");
        Ok(frame)
    }

    /// Undo everything since `frame` was created and drop it and every newer frame.
    ///
    /// The transaction stays active. A successful rollback to a savepoint also
    /// clears an abort caused by a failed statement after it.
    pub async fn rollback_to(&mut self, frame: &SavepointFrame) -> DbResult<()> {
        self.ensure_active("rollback_to")?;
        let position = self.position_of(frame)?;

        let dialect = self.conn.dialect();
        let sql = dialect.rollback_to_statement(&frame.name);
        if let Err(e) = self.conn.run(&sql, &[]).await {
            return Err(self.statement_failed(e));
        }
        self.savepoints.truncate(position);
        self.aborted = None;

        // ROLLBACK TO keeps the savepoint itself; release it so the name can be reused
        let sql = dialect.release_statement(&frame.name);
        if let Err(e) = self.conn.run(&sql, &[]).await {
            return Err(self.statement_failed(e));
        }

        debug!(transaction_id = %self.id, savepoint = %frame.name, "Rolled back to savepoint");
        Ok(())
    }

    /// Keep the work done since `frame` and drop it and every newer frame.
    pub async fn release_savepoint(&mut self, frame: &SavepointFrame) -> DbResult<()> {
        self.ensure_usable("release_savepoint")?;
        let position = self.position_of(frame)?;

        let sql = self.conn.dialect().release_statement(&frame.name);
        if let Err(e) = self.conn.run(&sql, &[]).await {
            return Err(self.statement_failed(e));
        }
        self.savepoints.truncate(position);
        debug!(transaction_id = %self.id, savepoint = %frame.name, "Savepoint released");
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// Only valid at the root: with savepoints still open this fails with
    /// [`DbError::InvalidState`] and leaves the transaction untouched. If the
    /// database rejects the commit, a rollback is attempted; the transaction ends
    /// `RolledBack`, or `Failed` with its connection marked broken.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_active("commit")?;
        if !self.savepoints.is_empty() {
            return Err(DbError::invalid_state(
                "commit",
                self.id.clone(),
                format!("active with {} open savepoint(s)", self.savepoints.len()),
            ));
        }
        if self.aborted.is_some() {
            return Err(self.aborted_error());
        }

        let sql = self.conn.dialect().commit_statement();
        match self.conn.run(sql, &[]).await {
            Ok(_) => {
                self.finish(TransactionState::Committed);
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Commit failed, rolling back");
                let err = DbError::from_driver(e, self.conn.id().to_string());
                self.rollback_after_failure().await;
                Err(err)
            }
        }
    }

    /// Roll back the whole transaction, whatever its savepoint depth.
    ///
    /// If the rollback itself fails, the transaction ends `Failed` and its
    /// connection is marked broken.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_active("rollback")?;
        let sql = self.conn.dialect().rollback_statement();
        match self.conn.run(sql, &[]).await {
            Ok(_) => {
                self.finish(TransactionState::RolledBack);
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Rollback failed, discarding connection");
                self.conn.mark_broken();
                self.finish(TransactionState::Failed);
                Err(DbError::from_driver(e, self.conn.id().to_string()))
            }
        }
    }

    async fn rollback_after_failure(&mut self) {
        let sql = self.conn.dialect().rollback_statement();
        match self.conn.run(sql, &[]).await {
            Ok(_) => self.finish(TransactionState::RolledBack),
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Rollback failed, discarding connection");
                self.conn.mark_broken();
                self.finish(TransactionState::Failed);
            }
        }
    }

    /// Release every open savepoint, outermost first.
    pub(crate) async fn release_all_savepoints(&mut self) -> DbResult<()> {
        if let Some(frame) = self.savepoints.first().cloned() {
            self.release_savepoint(&frame).await?;
        }
        Ok(())
    }

    fn position_of(&self, frame: &SavepointFrame) -> DbResult<usize> {
        self.savepoints
            .iter()
            .position(|f| f == frame)
            .ok_or_else(|| DbError::unknown_savepoint(frame.name.clone(), self.id.clone()))
    }

    fn ensure_active(&self, operation: &str) -> DbResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(DbError::invalid_state(operation, self.id.clone(), self.state))
        }
    }

    fn ensure_usable(&self, operation: &str) -> DbResult<()> {
        self.ensure_active(operation)?;
        if self.aborted.is_some() {
            return Err(self.aborted_error());
        }
        Ok(())
    }

    pub(crate) fn aborted_error(&self) -> DbError {
        DbError::transaction_aborted(
            self.id.clone(),
            self.aborted.clone().unwrap_or_default(),
        )
    }

    /// Record a failed statement, noting whether it aborted the transaction.
    fn statement_failed(&mut self, err: DriverError) -> DbError {
        if self.conn.dialect().aborts_transaction(&err) {
            warn!(
                transaction_id = %self.id,
                error = %err,
                "Statement aborted the transaction; rollback required"
            );
            self.aborted = Some(err.message.clone());
        }
        DbError::from_driver(err, self.conn.id().to_string())
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.savepoints.clear();
        self.aborted = None;
        if state != TransactionState::Failed {
            self.conn.set_in_transaction(false);
        }
        self.registry.lock().remove(&self.id);
        info!(transaction_id = %self.id, state = %state, "Transaction ended");
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("connection_id", &self.conn.id())
            .field("isolation", &self.isolation)
            .field("state", &self.state)
            .field("savepoints", &self.savepoints)
            .field("aborted", &self.aborted)
            .finish()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state.is_active() {
            warn!(
                transaction_id = %self.id,
                connection_id = %self.conn.id(),
                "Transaction dropped while active; its connection will not be reused"
            );
            self.registry.lock().remove(&self.id);
        }
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
