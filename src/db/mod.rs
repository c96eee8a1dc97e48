//! Database layer.
//!
//! - Driver primitive and its sqlx implementation
//! - Per-dialect SQL rendering
//! - Connections and the bounded connection pool
//! - Transactions with savepoints
//! - Blocking adapter for callers outside an async runtime

pub mod blocking;
pub mod connection;
pub mod dialect;
pub mod driver;
#[cfg(test)]
pub(crate) mod fake;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod sqlx_driver;
pub mod transaction;
pub mod types;

pub use blocking::{BlockingConnection, BlockingPool, BlockingTransaction};
pub use connection::Connection;
pub use dialect::validate_identifier;
pub use driver::{Driver, DriverError, DriverErrorKind, Session};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use sqlx_driver::{SqlxDriver, SqlxSession};
pub use transaction::{Transaction, TransactionManager};
