//! SQL the core issues on its own behalf, rendered per dialect.
//!
//! Identifiers interpolated here (savepoint names, ledger table names) are
//! validated with [`validate_identifier`] before they reach these functions.

use crate::db::driver::{DriverError, DriverErrorKind};
use crate::error::{DbError, DbResult};
use crate::models::{Dialect, IsolationLevel};

/// SQLSTATE / vendor codes that end the whole transaction, not just the statement.
const TRANSACTION_ABORTING_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "25P02", // in_failed_sql_transaction
    "1213",  // MySQL ER_LOCK_DEADLOCK
    "1205",  // MySQL ER_LOCK_WAIT_TIMEOUT
];

/// Check that `name` is a plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes.
pub fn validate_identifier(kind: &str, name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start
        || name.len() > 63
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(DbError::invalid_input(format!(
            "{kind} '{name}' must start with a letter or underscore and contain only letters, digits and underscores (max 63 characters)"
        )));
    }
    Ok(())
}

impl Dialect {
    /// Statements that open a transaction at `isolation`.
    ///
    /// SQLite transactions are always serializable, which satisfies every level.
    pub fn begin_statements(&self, isolation: IsolationLevel) -> Vec<String> {
        match self {
            Dialect::Postgres => vec![format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql())],
            Dialect::MySql => vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()),
                "START TRANSACTION".to_string(),
            ],
            // Take the write lock up front; a deferred read-then-write upgrade can fail with SQLITE_BUSY
            Dialect::Sqlite => vec!["BEGIN IMMEDIATE".to_string()],
        }
    }

    pub fn commit_statement(&self) -> &'static str {
        "COMMIT"
    }

    pub fn rollback_statement(&self) -> &'static str {
        "ROLLBACK"
    }

    pub fn savepoint_statement(&self, name: &str) -> String {
        format!("SAVEPOINT {name}")
    }

    pub fn rollback_to_statement(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {name}")
    }

    pub fn release_statement(&self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {name}")
    }

    /// Positional placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Whether `err`, raised inside a transaction, leaves the whole transaction aborted.
    ///
    /// PostgreSQL aborts the transaction on any error; other dialects only on
    /// serialization failures and deadlocks.
    pub fn aborts_transaction(&self, err: &DriverError) -> bool {
        if err.kind == DriverErrorKind::Connection {
            return true;
        }
        if *self == Dialect::Postgres {
            return true;
        }
        err.sql_state
            .as_deref()
            .is_some_and(|code| TRANSACTION_ABORTING_CODES.contains(&code))
    }

    /// Whether `err` reports a unique/primary key violation.
    pub fn is_unique_violation(&self, err: &DriverError) -> bool {
        let Some(code) = err.sql_state.as_deref() else {
            return false;
        };
        match self {
            Dialect::Postgres => code == "23505",
            Dialect::MySql => code == "1062" || code == "23000",
            // SQLITE_CONSTRAINT_PRIMARYKEY / SQLITE_CONSTRAINT_UNIQUE
            Dialect::Sqlite => code == "1555" || code == "2067",
        }
    }

    /// Ledger table DDL.
    pub fn create_ledger_table(&self, table: &str) -> String {
        match self {
            Dialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 version BIGINT PRIMARY KEY, \
                 name TEXT NOT NULL, \
                 checksum CHAR(64) NOT NULL, \
                 applied_at TIMESTAMPTZ NOT NULL)"
            ),
            Dialect::MySql => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 version BIGINT PRIMARY KEY, \
                 name VARCHAR(255) NOT NULL, \
                 checksum CHAR(64) NOT NULL, \
                 applied_at TIMESTAMP(6) NOT NULL)"
            ),
            Dialect::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 version INTEGER PRIMARY KEY, \
                 name TEXT NOT NULL, \
                 checksum TEXT NOT NULL, \
                 applied_at TIMESTAMP NOT NULL)"
            ),
        }
    }

    pub fn select_ledger(&self, table: &str) -> String {
        format!("SELECT version, name, checksum, applied_at FROM {table} ORDER BY version")
    }

    pub fn insert_ledger_record(&self, table: &str) -> String {
        format!(
            "INSERT INTO {table} (version, name, checksum, applied_at) VALUES ({}, {}, {}, {})",
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
            self.placeholder(4)
        )
    }

    pub fn delete_ledger_record(&self, table: &str) -> String {
        format!(
            "DELETE FROM {table} WHERE version = {}",
            self.placeholder(1)
        )
    }

    /// DDL for the single-row lock table used where advisory locks are unavailable.
    pub fn create_lock_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id INTEGER PRIMARY KEY, \
             holder TEXT NOT NULL, \
             acquired_at TEXT NOT NULL)"
        )
    }

    /// Non-blocking advisory lock attempt, returning one row with a `locked` column.
    pub fn try_advisory_lock(&self) -> Option<String> {
        match self {
            Dialect::Postgres => Some("SELECT pg_try_advisory_lock($1) AS locked".to_string()),
            Dialect::MySql => Some("SELECT GET_LOCK(?, 0) AS locked".to_string()),
            Dialect::Sqlite => None,
        }
    }

    pub fn advisory_unlock(&self) -> Option<String> {
        match self {
            Dialect::Postgres => Some("SELECT pg_advisory_unlock($1) AS unlocked".to_string()),
            Dialect::MySql => Some("SELECT RELEASE_LOCK(?) AS unlocked".to_string()),
            Dialect::Sqlite => None,
        }
    }

    /// Default probe used by pool health checks.
    pub fn default_health_check_query(&self) -> &'static str {
        "SELECT 1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_statements_per_dialect() {
        assert_eq!(
            Dialect::Postgres.begin_statements(IsolationLevel::Serializable),
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE"]
        );
        assert_eq!(
            Dialect::MySql.begin_statements(IsolationLevel::RepeatableRead),
            vec![
                "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
                "START TRANSACTION"
            ]
        );
        assert_eq!(
            Dialect::Sqlite.begin_statements(IsolationLevel::ReadUncommitted),
            vec!["BEGIN IMMEDIATE"]
        );
    }

    #[test]
    fn test_savepoint_statements() {
        let d = Dialect::Sqlite;
        assert_eq!(d.savepoint_statement("sp_1"), "SAVEPOINT sp_1");
        assert_eq!(d.rollback_to_statement("sp_1"), "ROLLBACK TO SAVEPOINT sp_1");
        assert_eq!(d.release_statement("sp_1"), "RELEASE SAVEPOINT sp_1");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::MySql.placeholder(2), "?");
        assert_eq!(
            Dialect::Postgres.insert_ledger_record("ledger"),
            "INSERT INTO ledger (version, name, checksum, applied_at) VALUES ($1, $2, $3, $4)"
        );
        assert_eq!(
            Dialect::Sqlite.delete_ledger_record("ledger"),
            "DELETE FROM ledger WHERE version = ?"
        );
    }

    #[test]
    fn test_postgres_aborts_on_any_statement_error() {
        let err = DriverError::statement("duplicate key", Some("23505".to_string()));
        assert!(Dialect::Postgres.aborts_transaction(&err));
        assert!(!Dialect::Sqlite.aborts_transaction(&err));
        assert!(!Dialect::MySql.aborts_transaction(&err));
    }

    #[test]
    fn test_deadlock_aborts_everywhere() {
        let mysql = DriverError::statement("Deadlock found", Some("1213".to_string()));
        assert!(Dialect::MySql.aborts_transaction(&mysql));
        let conn = DriverError::connection("reset");
        assert!(Dialect::Sqlite.aborts_transaction(&conn));
    }

    #[test]
    fn test_unique_violation_codes() {
        let pg = DriverError::statement("dup", Some("23505".to_string()));
        assert!(Dialect::Postgres.is_unique_violation(&pg));
        let sqlite = DriverError::statement("UNIQUE constraint failed", Some("1555".to_string()));
        assert!(Dialect::Sqlite.is_unique_violation(&sqlite));
        assert!(!Dialect::Sqlite.is_unique_violation(&DriverError::statement("x", None)));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("savepoint", "sp_1").is_ok());
        assert!(validate_identifier("savepoint", "_inner").is_ok());
        assert!(validate_identifier("savepoint", "").is_err());
        assert!(validate_identifier("savepoint", "1abc").is_err());
        assert!(validate_identifier("savepoint", "a; DROP TABLE x").is_err());
        assert!(validate_identifier("table", &"a".repeat(64)).is_err());
    }

    #[test]
    fn test_advisory_lock_only_where_supported() {
        assert!(Dialect::Postgres.try_advisory_lock().is_some());
        assert!(Dialect::MySql.advisory_unlock().is_some());
        assert!(Dialect::Sqlite.try_advisory_lock().is_none());
    }
}
