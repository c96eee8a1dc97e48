//! Database lifecycle library
//!
//! Bounded connection pooling, transactions with savepoints and isolation
//! levels, and versioned schema migrations for SQLite, PostgreSQL and MySQL.

pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;

pub use config::{DatabaseConfig, MigrationOptions, PoolArgs, PoolConfig};
pub use db::{
    BlockingConnection, BlockingPool, BlockingTransaction, Connection, ConnectionPool, PoolStatus,
    PooledConnection, Transaction, TransactionManager,
};
pub use error::{DbError, DbResult, ErrorCategory};
pub use migrate::{Migration, MigrationEngine, MigrationSet};
pub use models::{
    IsolationLevel, MigrationReport, MigrationStatus, QueryParam, QueryResult, SavepointFrame,
};
pub use tokio_util::sync::CancellationToken;
