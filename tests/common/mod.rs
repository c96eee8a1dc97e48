//! Shared helpers for integration tests.

#![allow(dead_code)]

use db_lifecycle::db::SqlxDriver;
use db_lifecycle::{ConnectionPool, Migration, MigrationSet, PoolConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Route `tracing` output through the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small, fast-failing pool settings for tests.
pub fn test_config(min_size: u32, max_size: u32) -> PoolConfig {
    PoolConfig {
        min_size,
        max_size,
        acquire_timeout: Duration::from_secs(5),
        close_grace_period: Duration::from_secs(1),
        ..PoolConfig::default()
    }
}

/// A pool over a fresh SQLite file. Keep the returned file alive for the test's duration.
pub async fn sqlite_pool(min_size: u32, max_size: u32) -> (ConnectionPool, NamedTempFile) {
    init_tracing();
    let file = NamedTempFile::new().expect("Failed to create temp file");
    let url = sqlite_url(&file);
    let pool = pool_for_url(&url, test_config(min_size, max_size)).await;
    (pool, file)
}

pub fn sqlite_url(file: &NamedTempFile) -> String {
    format!("sqlite:{}", file.path().display())
}

pub async fn pool_for_url(url: &str, config: PoolConfig) -> ConnectionPool {
    let driver = SqlxDriver::new(url).expect("Invalid test URL");
    ConnectionPool::new(Arc::new(driver), config)
        .await
        .expect("Failed to create pool")
}

/// URL from `var`, or `None` (with a note) so the test can skip.
pub fn server_url(var: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("Skipping test: {var} not set");
            None
        }
    }
}

pub fn sql(statements: &[&str]) -> Vec<String> {
    statements.iter().map(|s| s.to_string()).collect()
}

/// `accounts` table, then an `email` column; both reversible.
pub fn accounts_migrations(table: &str) -> MigrationSet {
    MigrationSet::new(vec![
        Migration::new(
            1,
            "create_accounts",
            vec![format!(
                "CREATE TABLE {table} (id INTEGER PRIMARY KEY, name VARCHAR(100) NOT NULL)"
            )],
            Some(vec![format!("DROP TABLE {table}")]),
        ),
        Migration::new(
            2,
            "add_email",
            vec![format!("ALTER TABLE {table} ADD COLUMN email VARCHAR(255)")],
            Some(vec![format!("ALTER TABLE {table} DROP COLUMN email")]),
        ),
    ])
    .expect("valid migration set")
}
