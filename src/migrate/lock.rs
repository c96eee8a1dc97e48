//! Mutual exclusion between concurrent migration runs.
//!
//! PostgreSQL and MySQL use session-level advisory locks, so the lock is tied to
//! the connection that took it and vanishes if that session dies. SQLite has no
//! advisory locks; a single-row lock table stands in for one.

use crate::config::MigrationOptions;
use crate::db::connection::Connection;
use crate::error::{DbError, DbResult};
use crate::models::{Dialect, QueryParam};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Longest pause between lock attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// MySQL rejects lock names longer than this.
const MYSQL_LOCK_NAME_MAX: usize = 64;

/// Advisory lock key for a ledger table.
pub fn lock_key(ledger_table: &str) -> i64 {
    xxh3_64(ledger_table.as_bytes()) as i64
}

/// MySQL named lock for a ledger table in `database`.
///
/// Named locks are server-wide, so the name carries the schema.
pub fn mysql_lock_name(database: &str, ledger_table: &str) -> String {
    let name = if database.is_empty() {
        ledger_table.to_string()
    } else {
        format!("{database}.{ledger_table}")
    };
    if name.len() <= MYSQL_LOCK_NAME_MAX {
        name
    } else {
        format!("migrations:{:016x}", xxh3_64(name.as_bytes()))
    }
}

enum LockKind {
    /// `pg_try_advisory_lock` on the xxh3 key, or MySQL `GET_LOCK` on the table name
    Advisory { param: QueryParam, label: String },
    /// Row `id = 1` in the lock table
    Table { table: String, holder: String },
}

/// A held migration lock. Release it with [`LedgerLock::release`].
pub struct LedgerLock {
    kind: LockKind,
    released: bool,
}

impl LedgerLock {
    /// Take the lock, polling with backoff until `options.lock_timeout` elapses.
    ///
    /// Returns `Ok(None)` if `cancel` fires while waiting.
    pub async fn acquire(
        conn: &mut Connection,
        options: &MigrationOptions,
        cancel: &CancellationToken,
    ) -> DbResult<Option<Self>> {
        let kind = match conn.dialect() {
            Dialect::Postgres => {
                let key = lock_key(&options.ledger_table);
                LockKind::Advisory {
                    param: QueryParam::Int(key),
                    label: format!("pg_advisory_lock({key})"),
                }
            }
            Dialect::MySql => {
                let result = conn.query("SELECT DATABASE() AS db", &[]).await?;
                let database = result
                    .scalar("db")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default();
                let name = mysql_lock_name(database, &options.ledger_table);
                LockKind::Advisory {
                    label: format!("GET_LOCK('{name}')"),
                    param: QueryParam::String(name),
                }
            }
            Dialect::Sqlite => {
                let table = options.lock_table();
                let ddl = conn.dialect().create_lock_table(&table);
                conn.execute(&ddl, &[]).await?;
                LockKind::Table {
                    table,
                    holder: format!("{}:{}", std::process::id(), uuid::Uuid::new_v4().simple()),
                }
            }
        };
        let mut lock = Self {
            kind,
            released: false,
        };

        let start = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            if lock.try_acquire(conn).await? {
                debug!(
                    lock = %lock.describe(),
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Migration lock acquired"
                );
                return Ok(Some(lock));
            }

            if start.elapsed() >= options.lock_timeout {
                // Nothing was taken, so there is nothing to release
                lock.released = true;
                return Err(DbError::LockTimeout {
                    lock: lock.describe(),
                    waited_secs: start.elapsed().as_secs(),
                });
            }

            let delay = Duration::from_millis(10u64 << attempts.min(5)).min(MAX_BACKOFF);
            trace!(attempts, delay_ms = delay.as_millis() as u64, "Migration lock busy, backing off");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    info!(attempts, "Migration cancelled while waiting for the lock");
                    lock.released = true;
                    return Ok(None);
                }
            }
        }
    }

    async fn try_acquire(&self, conn: &mut Connection) -> DbResult<bool> {
        match &self.kind {
            LockKind::Advisory { param, .. } => {
                let Some(sql) = conn.dialect().try_advisory_lock() else {
                    return Err(DbError::internal(format!(
                        "{} has no advisory locks",
                        conn.dialect()
                    )));
                };
                let result = conn.query(&sql, std::slice::from_ref(param)).await?;
                Ok(result.scalar("locked").is_some_and(is_truthy))
            }
            LockKind::Table { table, holder } => {
                let sql = format!(
                    "INSERT INTO {table} (id, holder, acquired_at) VALUES (1, ?, ?)"
                );
                let params = [
                    QueryParam::String(holder.clone()),
                    QueryParam::String(Utc::now().to_rfc3339()),
                ];
                match conn.run(&sql, &params).await {
                    Ok(_) => Ok(true),
                    Err(e) if conn.dialect().is_unique_violation(&e) => Ok(false),
                    Err(e) => Err(DbError::from_driver(e, conn.id().to_string())),
                }
            }
        }
    }

    /// Whether the lock lives and dies with the session that took it.
    pub fn is_session_scoped(&self) -> bool {
        !matches!(self.kind, LockKind::Table { .. })
    }

    /// Release the lock on `conn`.
    ///
    /// Session-scoped locks are taken on, and must be released on, the same
    /// connection; if that connection has failed, the lock is freed when its
    /// session closes. Failures are logged, not returned.
    pub async fn release(mut self, conn: &mut Connection) {
        self.released = true;
        if self.is_session_scoped() && !conn.is_connected() {
            debug!(lock = %self.describe(), "Lock session is gone; lock freed with it");
            return;
        }

        let result = match &self.kind {
            LockKind::Advisory { param, .. } => match conn.dialect().advisory_unlock() {
                Some(sql) => conn
                    .query(&sql, std::slice::from_ref(param))
                    .await
                    .map(|r| r.scalar("unlocked").is_some_and(is_truthy)),
                None => Ok(false),
            },
            LockKind::Table { table, holder } => conn
                .execute(
                    &format!("DELETE FROM {table} WHERE id = 1 AND holder = ?"),
                    &[QueryParam::String(holder.clone())],
                )
                .await
                .map(|deleted| deleted == 1),
        };

        match result {
            Ok(true) => debug!(lock = %self.describe(), "Migration lock released"),
            Ok(false) => warn!(lock = %self.describe(), "Migration lock was not held at release"),
            Err(e) => warn!(lock = %self.describe(), error = %e, "Failed to release migration lock"),
        }
    }

    /// Give up on a lock that could not be released.
    ///
    /// Session-scoped locks go away with their session; a table lock row stays
    /// until it is deleted by hand.
    pub fn abandon(mut self) {
        self.released = true;
        warn!(lock = %self.describe(), "Migration lock abandoned while still held");
    }

    fn describe(&self) -> String {
        match &self.kind {
            LockKind::Advisory { label, .. } => label.clone(),
            LockKind::Table { table, .. } => format!("{table}(id = 1)"),
        }
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                lock = %self.describe(),
                "Migration lock dropped without release - consider using explicit release()"
            );
        }
    }
}

/// Lock functions return booleans on PostgreSQL and 0/1 on MySQL.
fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}
