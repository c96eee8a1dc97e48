//! Driver primitive the core is built on.
//!
//! A [`Driver`] opens sessions; a [`Session`] executes one statement at a time and
//! reports failures as [`DriverError`]s that say whether the session itself is
//! still usable.

use crate::models::{Dialect, QueryParam, Row};
use async_trait::async_trait;

/// Whether a failure broke the session or only the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Socket, protocol or authentication failure; the session is unusable
    Connection,
    /// Constraint violation, syntax error and the like; the session survives
    Statement,
}

/// Error reported by a driver or session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    /// SQLSTATE or vendor error code, when the database reported one
    pub sql_state: Option<String>,
}

impl DriverError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Connection,
            message: message.into(),
            sql_state: None,
        }
    }

    pub fn statement(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self {
            kind: DriverErrorKind::Statement,
            message: message.into(),
            sql_state,
        }
    }

    pub fn is_connection(&self) -> bool {
        self.kind == DriverErrorKind::Connection
    }
}

/// Convert sqlx errors to DriverError.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DriverError::statement(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DriverError::statement("No rows returned", None),
            sqlx::Error::TypeNotFound { type_name } => {
                DriverError::statement(format!("Type not found: {}", type_name), None)
            }
            sqlx::Error::ColumnNotFound(col) => {
                DriverError::statement(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DriverError::statement(
                format!("Column index {} out of bounds (len: {})", index, len),
                None,
            ),
            sqlx::Error::ColumnDecode { index, source } => DriverError::statement(
                format!("Failed to decode column {}: {}", index, source),
                None,
            ),
            sqlx::Error::Decode(source) => {
                DriverError::statement(format!("Decode error: {}", source), None)
            }
            sqlx::Error::Encode(source) => {
                DriverError::statement(format!("Encode error: {}", source), None)
            }
            sqlx::Error::Configuration(msg) => {
                DriverError::connection(format!("Configuration error: {}", msg))
            }
            sqlx::Error::Io(io_err) => DriverError::connection(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => {
                DriverError::connection(format!("TLS error: {}", tls_err))
            }
            sqlx::Error::Protocol(msg) => {
                DriverError::connection(format!("Protocol error: {}", msg))
            }
            sqlx::Error::WorkerCrashed => DriverError::connection("Database worker crashed"),
            other => DriverError::connection(format!("Driver error: {}", other)),
        }
    }
}

/// One live database session.
///
/// Sessions are single-threaded: the core never issues two statements on the
/// same session concurrently.
#[async_trait]
pub trait Session: Send {
    /// Execute a statement, returning the affected row count.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> Result<u64, DriverError>;

    /// Execute a statement and collect its rows.
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> Result<Vec<Row>, DriverError>;

    /// Close the session. Errors are not reported; the session is gone either way.
    async fn close(self: Box<Self>);
}

/// Factory for sessions against one database.
#[async_trait]
pub trait Driver: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Open a new session.
    async fn connect(&self) -> Result<Box<dyn Session>, DriverError>;
}
