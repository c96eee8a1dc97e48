//! Error types for connection, transaction and migration handling.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every variant carries enough context (connection id, transaction id, savepoint
//! name or migration version) to diagnose a failure without correlating logs.

use crate::db::driver::{DriverError, DriverErrorKind};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Timed out after {waited_ms}ms waiting for a pooled connection")]
    PoolTimeout { waited_ms: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection failed: {message} (connection: {connection_id})")]
    Connection {
        message: String,
        connection_id: String,
        sql_state: Option<String>,
    },

    #[error("Statement failed: {message} (connection: {connection_id})")]
    Statement {
        message: String,
        connection_id: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Invalid state for {operation}: transaction {transaction_id} is {state}")]
    InvalidState {
        operation: String,
        transaction_id: String,
        state: String,
    },

    #[error("Unknown savepoint '{name}' (transaction: {transaction_id})")]
    UnknownSavepoint { name: String, transaction_id: String },

    #[error(
        "Transaction {transaction_id} is aborted ({reason}); roll back before issuing more statements"
    )]
    TransactionAborted {
        transaction_id: String,
        reason: String,
    },

    #[error("Duplicate migration version {version}: '{first}' and '{second}'")]
    DuplicateVersion {
        version: i64,
        first: String,
        second: String,
    },

    #[error("Migration {version} ('{name}') has no down statements and cannot be reverted")]
    IrreversibleMigration { version: i64, name: String },

    #[error(
        "Migration {version} ('{name}') changed after it was applied: ledger checksum {recorded}, current {current}"
    )]
    MigrationDrift {
        version: i64,
        name: String,
        recorded: String,
        current: String,
    },

    #[error("Applied migration {version} ('{name}') is not present in the migration set")]
    MissingMigration { version: i64, name: String },

    #[error(
        "Migration {version} is pending below applied version {latest_applied}; enable out-of-order runs to apply it"
    )]
    OutOfOrderMigration { version: i64, latest_applied: i64 },

    #[error("Migration {version} ('{name}') failed: {source}")]
    MigrationFailed {
        version: i64,
        name: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Timeout: could not take migration lock '{lock}' within {waited_secs}s")]
    LockTimeout { lock: String, waited_secs: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse grouping of [`DbError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Pool,
    Connection,
    Query,
    Transaction,
    Migration,
    Configuration,
    Internal,
}

impl DbError {
    /// Create a pool timeout error.
    pub fn pool_timeout(waited: Duration) -> Self {
        Self::PoolTimeout {
            waited_ms: waited.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            connection_id: connection_id.into(),
            sql_state: None,
        }
    }

    /// Create a statement error with optional SQL state.
    pub fn statement(
        message: impl Into<String>,
        connection_id: impl Into<String>,
        sql_state: Option<String>,
    ) -> Self {
        Self::Statement {
            message: message.into(),
            connection_id: connection_id.into(),
            sql_state,
        }
    }

    /// Convert a driver failure, keeping the connection/statement distinction.
    pub fn from_driver(err: DriverError, connection_id: impl Into<String>) -> Self {
        match err.kind {
            DriverErrorKind::Connection => Self::Connection {
                message: err.message,
                connection_id: connection_id.into(),
                sql_state: err.sql_state,
            },
            DriverErrorKind::Statement => Self::Statement {
                message: err.message,
                connection_id: connection_id.into(),
                sql_state: err.sql_state,
            },
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(
        operation: impl Into<String>,
        transaction_id: impl Into<String>,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            transaction_id: transaction_id.into(),
            state: state.to_string(),
        }
    }

    /// Create an unknown savepoint error.
    pub fn unknown_savepoint(name: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::UnknownSavepoint {
            name: name.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a transaction aborted error.
    pub fn transaction_aborted(
        transaction_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TransactionAborted {
            transaction_id: transaction_id.into(),
            reason: reason.into(),
        }
    }

    /// Wrap the failure of a single migration.
    pub fn migration_failed(version: i64, name: impl Into<String>, source: DbError) -> Self {
        Self::MigrationFailed {
            version,
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PoolTimeout { .. } | Self::PoolClosed => ErrorCategory::Pool,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Statement { .. } => ErrorCategory::Query,
            Self::Transaction { .. }
            | Self::InvalidState { .. }
            | Self::UnknownSavepoint { .. }
            | Self::TransactionAborted { .. } => ErrorCategory::Transaction,
            Self::DuplicateVersion { .. }
            | Self::IrreversibleMigration { .. }
            | Self::MigrationDrift { .. }
            | Self::MissingMigration { .. }
            | Self::OutOfOrderMigration { .. }
            | Self::MigrationFailed { .. }
            | Self::LockTimeout { .. } => ErrorCategory::Migration,
            Self::Config { .. } | Self::InvalidInput { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// SQL state reported by the database, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Connection { sql_state, .. } | Self::Statement { sql_state, .. } => {
                sql_state.as_deref()
            }
            Self::MigrationFailed { source, .. } => source.sql_state(),
            _ => None,
        }
    }

    /// Check if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolTimeout { .. } | Self::Connection { .. } | Self::LockTimeout { .. }
        )
    }

    /// Migration-definition integrity failures that need a human to fix.
    pub fn requires_intervention(&self) -> bool {
        matches!(
            self,
            Self::DuplicateVersion { .. }
                | Self::IrreversibleMigration { .. }
                | Self::MigrationDrift { .. }
                | Self::MissingMigration { .. }
                | Self::OutOfOrderMigration { .. }
        )
    }

    /// True when the failure came from the connection itself rather than a statement.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::MigrationFailed { source, .. } => source.is_connection_failure(),
            _ => false,
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
