//! Scriptable in-memory driver for unit tests.

use crate::db::driver::{Driver, DriverError, Session};
use crate::models::{Dialect, QueryParam, Row};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    statements: Vec<String>,
    opened: usize,
    closed: usize,
    failing_connects: usize,
    connect_error: Option<DriverError>,
    connect_delay: Option<Duration>,
    failures: Vec<(String, DriverError)>,
    delays: Vec<(String, Duration)>,
    rows: Vec<(String, Vec<Row>)>,
}

/// Driver whose sessions record every statement and fail on demand.
#[derive(Clone)]
pub struct FakeDriver {
    dialect: Dialect,
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::with_dialect(Dialect::Postgres)
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Arc::default(),
        }
    }

    /// Statements executed so far, across all sessions.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state.lock().statements.clear();
    }

    pub fn opened_sessions(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.lock().closed
    }

    /// Fail the next `count` connect attempts with a connection error.
    pub fn fail_next_connects(&self, count: usize) {
        let mut state = self.state.lock();
        state.failing_connects = count;
        state.connect_error = Some(DriverError::connection("connection refused"));
    }

    /// Sleep for `delay` before each connect attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    /// Fail every statement containing `pattern`.
    pub fn fail_statements_matching(&self, pattern: &str, err: DriverError) {
        self.state.lock().failures.push((pattern.to_string(), err));
    }

    /// Stall every statement containing `pattern` for `delay` before it runs.
    pub fn delay_statements_matching(&self, pattern: &str, delay: Duration) {
        self.state.lock().delays.push((pattern.to_string(), delay));
    }

    /// Return `rows` for queries containing `pattern`.
    pub fn set_rows(&self, pattern: &str, rows: Vec<Row>) {
        self.state.lock().rows.push((pattern.to_string(), rows));
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn connect(&self) -> Result<Box<dyn Session>, DriverError> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            let err = state
                .connect_error
                .clone()
                .unwrap_or_else(|| DriverError::connection("connection refused"));
            return Err(err);
        }
        state.opened += 1;
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    async fn stall(&self, sql: &str) {
        let delay = self
            .state
            .lock()
            .delays
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, sql: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.statements.push(sql.to_string());
        match state.failures.iter().find(|(p, _)| sql.contains(p.as_str())) {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> Result<u64, DriverError> {
        self.stall(sql).await;
        self.record(sql)?;
        Ok(1)
    }

    async fn query(&mut self, sql: &str, _params: &[QueryParam]) -> Result<Vec<Row>, DriverError> {
        self.stall(sql).await;
        self.record(sql)?;
        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn close(self: Box<Self>) {
        self.state.lock().closed += 1;
    }
}
