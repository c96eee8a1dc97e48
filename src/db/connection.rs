//! A single database session with pool bookkeeping.

use crate::db::driver::{Driver, DriverError, Session};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionId, ConnectionState, Dialect, QueryParam, QueryResult, Row};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// One live database session.
///
/// A connection is used by one task at a time. Connections obtained from a
/// [`ConnectionPool`](crate::db::pool::ConnectionPool) are returned to it when
/// the lease is released; a standalone connection from [`Connection::connect`]
/// is closed with [`Connection::close`].
pub struct Connection {
    id: ConnectionId,
    session: Option<Box<dyn Session>>,
    dialect: Dialect,
    state: ConnectionState,
    created_at: Instant,
    last_used_at: Instant,
    in_transaction: bool,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, session: Box<dyn Session>, dialect: Dialect) -> Self {
        let now = Instant::now();
        Self {
            id,
            session: Some(session),
            dialect,
            state: ConnectionState::Idle,
            created_at: now,
            last_used_at: now,
            in_transaction: false,
        }
    }

    /// Open a standalone connection, outside any pool.
    pub async fn connect(driver: &dyn Driver) -> DbResult<Self> {
        let id = next_connection_id();
        let session = driver
            .connect()
            .await
            .map_err(|e| DbError::from_driver(e, id.to_string()))?;
        debug!(connection_id = %id, dialect = %driver.dialect(), "Opened connection");
        Ok(Self::new(id, session, driver.dialect()))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True while the session is open and has not failed at the connection level.
    pub fn is_connected(&self) -> bool {
        self.session.is_some() && !self.is_broken()
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnectionState::Broken
    }

    /// True while a transaction begun on this connection has not ended.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Time since the session was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last statement completed.
    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.run(sql, params)
            .await
            .map_err(|e| DbError::from_driver(e, self.id.to_string()))
    }

    /// Execute a statement and collect its rows.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.fetch(sql, params)
            .await
            .map(QueryResult::new)
            .map_err(|e| DbError::from_driver(e, self.id.to_string()))
    }

    /// Close the session. The connection cannot be used afterwards.
    pub async fn close(mut self) {
        self.shutdown().await;
    }

    pub(crate) async fn shutdown(&mut self) {
        self.state = ConnectionState::Closed;
        if let Some(session) = self.session.take() {
            session.close().await;
            debug!(connection_id = %self.id, "Closed connection");
        }
    }

    /// Run a statement, keeping the driver's error classification.
    pub(crate) async fn run(&mut self, sql: &str, params: &[QueryParam]) -> Result<u64, DriverError> {
        let session = self.usable_session()?;
        let result = session.execute(sql, params).await;
        self.after_statement(result.as_ref().err());
        result
    }

    pub(crate) async fn fetch(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, DriverError> {
        let session = self.usable_session()?;
        let result = session.query(sql, params).await;
        self.after_statement(result.as_ref().err());
        result
    }

    /// Run the health check statement; a failure marks the connection broken.
    pub(crate) async fn ping(&mut self, sql: &str) -> bool {
        match self.fetch(sql, &[]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Health check failed");
                self.mark_broken();
                false
            }
        }
    }

    pub(crate) fn mark_broken(&mut self) {
        self.state = ConnectionState::Broken;
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if !self.is_broken() {
            self.state = state;
        }
    }

    fn usable_session(&mut self) -> Result<&mut Box<dyn Session>, DriverError> {
        if self.is_broken() {
            return Err(DriverError::connection(format!(
                "Connection {} is broken",
                self.id
            )));
        }
        self.session
            .as_mut()
            .ok_or_else(|| DriverError::connection(format!("Connection {} is closed", self.id)))
    }

    fn after_statement(&mut self, err: Option<&DriverError>) {
        self.last_used_at = Instant::now();
        if let Some(e) = err {
            if e.is_connection() {
                warn!(connection_id = %self.id, error = %e, "Connection failed");
                self.mark_broken();
            }
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Connection {} state={}>", self.id, self.state)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("dialect", &self.dialect)
            .field("state", &self.state)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}
