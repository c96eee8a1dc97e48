//! Thread-blocking facade over the async pool.
//!
//! For callers that are not running inside a tokio runtime. Every call blocks
//! the current thread on a runtime owned by the [`BlockingPool`]; calling these
//! methods from within an async task panics, as with any `block_on`.

use crate::config::DatabaseConfig;
use crate::db::pool::{ConnectionPool, PoolStatus, PooledConnection};
use crate::db::transaction::{Transaction, TransactionManager};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, QueryParam, QueryResult, SavepointFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::warn;

/// A [`ConnectionPool`] driven from synchronous code.
#[derive(Clone)]
pub struct BlockingPool {
    runtime: Arc<Runtime>,
    pool: ConnectionPool,
    transactions: TransactionManager,
}

impl BlockingPool {
    /// Build a runtime and connect a pool described by `database` (`[id=]url?options`).
    pub fn connect(database: &str) -> DbResult<Self> {
        let config = DatabaseConfig::parse(database).map_err(DbError::config)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::internal(format!("Failed to start runtime: {}", e)))?;
        let pool = runtime.block_on(ConnectionPool::connect(&config, None))?;
        Ok(Self::from_pool(Arc::new(runtime), pool))
    }

    /// Wrap an existing pool. `runtime` must be the one the pool was created on.
    pub fn from_pool(runtime: Arc<Runtime>, pool: ConnectionPool) -> Self {
        Self {
            runtime,
            pool,
            transactions: TransactionManager::new(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn acquire(&self) -> DbResult<BlockingConnection> {
        let lease = self.runtime.block_on(self.pool.acquire())?;
        Ok(self.wrap(lease))
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> DbResult<BlockingConnection> {
        let lease = self.runtime.block_on(self.pool.acquire_timeout(timeout))?;
        Ok(self.wrap(lease))
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn close(&self) {
        self.runtime.block_on(self.pool.close());
    }

    fn wrap(&self, lease: PooledConnection) -> BlockingConnection {
        BlockingConnection {
            lease,
            runtime: Arc::clone(&self.runtime),
            transactions: self.transactions.clone(),
        }
    }
}

/// A leased connection for synchronous callers. Return it with [`release`](Self::release).
pub struct BlockingConnection {
    lease: PooledConnection,
    runtime: Arc<Runtime>,
    transactions: TransactionManager,
}

impl BlockingConnection {
    pub fn id(&self) -> crate::models::ConnectionId {
        self.lease.id()
    }

    pub fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.runtime.block_on(self.lease.execute(sql, params))
    }

    pub fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.runtime.block_on(self.lease.query(sql, params))
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<T>(
        &mut self,
        isolation: IsolationLevel,
        f: impl FnOnce(&mut BlockingTransaction<'_, '_>) -> DbResult<T>,
    ) -> DbResult<T> {
        let runtime = Arc::clone(&self.runtime);
        let mut tx = runtime.block_on(self.transactions.begin(&mut self.lease, isolation))?;

        let result = {
            let mut handle = BlockingTransaction {
                tx: &mut tx,
                runtime: &runtime,
            };
            f(&mut handle)
        };

        match result {
            Ok(value) => {
                if tx.state().is_active() {
                    if tx.is_aborted() {
                        let err = tx.aborted_error();
                        runtime.block_on(tx.rollback())?;
                        return Err(err);
                    }
                    runtime.block_on(tx.release_all_savepoints())?;
                    runtime.block_on(tx.commit())?;
                }
                Ok(value)
            }
            Err(e) => {
                if tx.state().is_active() {
                    if let Err(rollback_err) = runtime.block_on(tx.rollback()) {
                        warn!(
                            transaction_id = %tx.id(),
                            error = %rollback_err,
                            "Rollback after failed unit of work also failed"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        self.runtime.block_on(self.lease.release());
    }

    /// Return the connection and have the pool discard it.
    pub fn release_broken(self) {
        self.runtime.block_on(self.lease.release_broken());
    }
}

/// Transaction handle passed to [`BlockingConnection::transaction`].
///
/// Commit and rollback of the whole transaction are left to the closure's result;
/// savepoints can be managed explicitly.
pub struct BlockingTransaction<'a, 'c> {
    tx: &'a mut Transaction<'c>,
    runtime: &'a Runtime,
}

impl BlockingTransaction<'_, '_> {
    pub fn id(&self) -> &str {
        self.tx.id()
    }

    pub fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.runtime.block_on(self.tx.execute(sql, params))
    }

    pub fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.runtime.block_on(self.tx.query(sql, params))
    }

    pub fn savepoint(&mut self, name: &str) -> DbResult<SavepointFrame> {
        self.runtime.block_on(self.tx.savepoint(name))
    }

    pub fn rollback_to(&mut self, frame: &SavepointFrame) -> DbResult<()> {
        self.runtime.block_on(self.tx.rollback_to(frame))
    }

    pub fn release_savepoint(&mut self, frame: &SavepointFrame) -> DbResult<()> {
        self.runtime.block_on(self.tx.release_savepoint(frame))
    }
}
