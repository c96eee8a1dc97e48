//! Data models shared by the pool, transaction and migration layers.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod migration;
pub mod query;
pub mod transaction;

// Re-export commonly used types
pub use connection::{ConnectionId, ConnectionState, Dialect, mask_connection_string};
pub use migration::{MigrationDirection, MigrationRecord, MigrationReport, MigrationStatus};
pub use query::{QueryParam, QueryResult, Row};
pub use transaction::{IsolationLevel, SavepointFrame, TransactionMetadata, TransactionState};
