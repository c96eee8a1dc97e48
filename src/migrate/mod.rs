//! Versioned schema migrations with a ledger table and a cross-process lock.

pub mod engine;
pub mod ledger;
pub mod lock;
pub mod migration;

pub use engine::MigrationEngine;
pub use lock::{LedgerLock, lock_key, mysql_lock_name};
pub use migration::{Migration, MigrationSet};
