//! Applies and reverts migrations against the ledger.
//!
//! A run leases one connection, takes the ledger lock on it, bootstraps the
//! ledger, then executes each migration in its own transaction together with
//! its ledger insert or delete. A failure halts the run; migrations committed
//! before it stay applied.

use crate::config::MigrationOptions;
use crate::db::connection::Connection;
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::db::transaction::TransactionManager;
use crate::error::{DbError, DbResult};
use crate::migrate::ledger::{self, BOOTSTRAP_VERSION};
use crate::migrate::lock::LedgerLock;
use crate::migrate::migration::{Migration, MigrationSet};
use crate::models::{MigrationDirection, MigrationRecord, MigrationReport, MigrationStatus};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct MigrationEngine {
    migrations: MigrationSet,
    options: MigrationOptions,
    transactions: TransactionManager,
}

impl MigrationEngine {
    /// Engine with default options (`_schema_migrations` ledger).
    pub fn new(migrations: MigrationSet) -> Self {
        Self {
            migrations,
            options: MigrationOptions::default(),
            transactions: TransactionManager::new(),
        }
    }

    pub fn with_options(migrations: MigrationSet, options: MigrationOptions) -> DbResult<Self> {
        options.validate()?;
        Ok(Self {
            migrations,
            options,
            transactions: TransactionManager::new(),
        })
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Merge the ledger with the migration set, in version order.
    ///
    /// Creates the ledger if it does not exist yet. Fails with
    /// [`DbError::MigrationDrift`] if an applied migration's definition changed.
    pub async fn status(&self, pool: &ConnectionPool) -> DbResult<Vec<MigrationStatus>> {
        let lease = pool.acquire().await?;
        let records = self.read_ledger(pool, lease).await?;
        let applied = applied_records(records);
        self.verify_checksums(applied.values())?;
        Ok(self.merge_status(&applied))
    }

    /// Apply every pending migration up to `target` (all when `None`), in version order.
    ///
    /// Already-applied versions are skipped. `cancel` is checked between
    /// migrations; a cancelled run reports the last version it committed.
    pub async fn migrate_up(
        &self,
        pool: &ConnectionPool,
        target: Option<i64>,
        cancel: &CancellationToken,
    ) -> DbResult<MigrationReport> {
        let mut lease = pool.acquire().await?;
        let result = match self.lock_ledger(&mut lease, cancel).await {
            Ok(Some(lock)) => {
                let outcome = self.apply_up(&mut lease, target, cancel).await;
                self.unlock(pool, lease, lock).await;
                outcome
            }
            Ok(None) => {
                lease.release().await;
                Ok(cancelled_report(MigrationDirection::Up))
            }
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        };
        log_outcome(&result);
        result
    }

    /// Revert the `steps` most recently applied migrations, newest first.
    ///
    /// Every targeted migration is checked before any runs: it must still be in
    /// the set, unchanged, and have down statements.
    pub async fn migrate_down(
        &self,
        pool: &ConnectionPool,
        steps: usize,
        cancel: &CancellationToken,
    ) -> DbResult<MigrationReport> {
        let mut lease = pool.acquire().await?;
        let result = match self.lock_ledger(&mut lease, cancel).await {
            Ok(Some(lock)) => {
                let outcome = self.apply_down(&mut lease, steps, cancel).await;
                self.unlock(pool, lease, lock).await;
                outcome
            }
            Ok(None) => {
                lease.release().await;
                Ok(cancelled_report(MigrationDirection::Down))
            }
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        };
        log_outcome(&result);
        result
    }

    /// Read the ledger on `lease`, then release it.
    async fn read_ledger(
        &self,
        pool: &ConnectionPool,
        mut lease: PooledConnection,
    ) -> DbResult<Vec<MigrationRecord>> {
        let table = self.options.ledger_table.as_str();
        match ledger::read_records(&mut lease, table).await {
            Err(DbError::Statement { .. }) => {}
            other => {
                lease.release().await;
                return other;
            }
        }

        // Most likely no ledger yet: create it under the lock and read again
        debug!(ledger = table, "Ledger not readable, bootstrapping");
        let never = CancellationToken::new();
        let lock = match self.lock_ledger(&mut lease, &never).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                lease.release().await;
                return Err(DbError::internal("Ledger lock wait ended without a lock"));
            }
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };
        let records = ledger::read_records(&mut lease, table).await;
        self.unlock(pool, lease, lock).await;
        records
    }

    fn merge_status(&self, applied: &BTreeMap<i64, MigrationRecord>) -> Vec<MigrationStatus> {
        let latest_applied = applied.keys().next_back().copied();
        let mut statuses: BTreeMap<i64, MigrationStatus> = self
            .migrations
            .iter()
            .map(|m| {
                let record = applied.get(&m.version());
                let status = MigrationStatus {
                    version: m.version(),
                    name: m.name().to_string(),
                    applied: record.is_some(),
                    applied_at: record.map(|r| r.applied_at),
                    out_of_order: record.is_none()
                        && latest_applied.is_some_and(|latest| m.version() < latest),
                    missing_source: false,
                };
                (m.version(), status)
            })
            .collect();

        for record in applied.values() {
            statuses
                .entry(record.version)
                .or_insert_with(|| MigrationStatus {
                    version: record.version,
                    name: record.name.clone(),
                    applied: true,
                    applied_at: Some(record.applied_at),
                    out_of_order: false,
                    missing_source: true,
                });
        }
        statuses.into_values().collect()
    }

    /// Take the ledger lock, then make sure the ledger exists.
    async fn lock_ledger(
        &self,
        conn: &mut Connection,
        cancel: &CancellationToken,
    ) -> DbResult<Option<LedgerLock>> {
        let Some(lock) = LedgerLock::acquire(conn, &self.options, cancel).await? else {
            return Ok(None);
        };
        if let Err(e) = ledger::bootstrap(conn, &self.transactions, &self.options).await {
            lock.release(conn).await;
            return Err(e);
        }
        Ok(Some(lock))
    }

    /// Release the lock, then the run's lease.
    ///
    /// A table lock whose session failed is deleted on a fresh connection,
    /// acquired only after the failed lease went back to the pool.
    async fn unlock(&self, pool: &ConnectionPool, mut lease: PooledConnection, lock: LedgerLock) {
        if lease.is_connected() || lock.is_session_scoped() {
            lock.release(&mut lease).await;
            lease.release().await;
            return;
        }
        lease.release().await;
        match pool.acquire().await {
            Ok(mut other) => {
                lock.release(&mut other).await;
                other.release().await;
            }
            Err(e) => {
                warn!(error = %e, "No connection to release the migration lock on");
                lock.abandon();
            }
        }
    }

    async fn apply_up(
        &self,
        conn: &mut Connection,
        target: Option<i64>,
        cancel: &CancellationToken,
    ) -> DbResult<MigrationReport> {
        let records = ledger::read_records(conn, &self.options.ledger_table).await?;
        let applied = applied_records(records);
        self.verify_checksums(applied.values())?;

        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| !applied.contains_key(&m.version()))
            .filter(|m| target.is_none_or(|t| m.version() <= t))
            .collect();

        if !self.options.allow_out_of_order {
            if let Some(&latest_applied) = applied.keys().next_back() {
                if let Some(m) = pending.iter().find(|m| m.version() < latest_applied) {
                    return Err(DbError::OutOfOrderMigration {
                        version: m.version(),
                        latest_applied,
                    });
                }
            }
        }

        let mut report = MigrationReport::new(MigrationDirection::Up);
        for migration in pending {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            info!(version = migration.version(), name = migration.name(), "Applying migration");
            self.run_migration(conn, migration, MigrationDirection::Up)
                .await
                .map_err(|e| DbError::migration_failed(migration.version(), migration.name(), e))?;
            report.record(migration.version());
        }
        Ok(report)
    }

    async fn apply_down(
        &self,
        conn: &mut Connection,
        steps: usize,
        cancel: &CancellationToken,
    ) -> DbResult<MigrationReport> {
        let records = ledger::read_records(conn, &self.options.ledger_table).await?;
        let applied = applied_records(records);

        let mut targets = Vec::with_capacity(steps);
        for record in applied.values().rev().take(steps) {
            let migration =
                self.migrations
                    .get(record.version)
                    .ok_or_else(|| DbError::MissingMigration {
                        version: record.version,
                        name: record.name.clone(),
                    })?;
            check_checksum(record, migration)?;
            if !migration.is_reversible() {
                return Err(DbError::IrreversibleMigration {
                    version: migration.version(),
                    name: migration.name().to_string(),
                });
            }
            targets.push(migration);
        }

        let mut report = MigrationReport::new(MigrationDirection::Down);
        for migration in targets {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            info!(version = migration.version(), name = migration.name(), "Reverting migration");
            self.run_migration(conn, migration, MigrationDirection::Down)
                .await
                .map_err(|e| DbError::migration_failed(migration.version(), migration.name(), e))?;
            report.record(migration.version());
        }
        Ok(report)
    }

    /// One migration in one transaction: its statements plus the ledger change.
    async fn run_migration(
        &self,
        conn: &mut Connection,
        migration: &Migration,
        direction: MigrationDirection,
    ) -> DbResult<()> {
        let table = self.options.ledger_table.as_str();
        let statements = match direction {
            MigrationDirection::Up => migration.up(),
            MigrationDirection::Down => migration.down().unwrap_or_default(),
        };

        let mut tx = self.transactions.begin(conn, self.options.isolation).await?;
        let result: DbResult<()> = async {
            for sql in statements {
                tx.execute(sql, &[]).await?;
            }
            match direction {
                MigrationDirection::Up => ledger::insert_record(&mut tx, table, migration).await,
                MigrationDirection::Down => {
                    ledger::delete_record(&mut tx, table, migration.version()).await
                }
            }
        }
        .await;

        match result {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        version = migration.version(),
                        error = %rollback_err,
                        "Rollback of failed migration also failed"
                    );
                }
                Err(e)
            }
        }
    }

    fn verify_checksums<'a>(
        &self,
        records: impl Iterator<Item = &'a MigrationRecord>,
    ) -> DbResult<()> {
        for record in records {
            if let Some(migration) = self.migrations.get(record.version) {
                check_checksum(record, migration)?;
            }
        }
        Ok(())
    }
}

/// Applied records keyed by version, without the ledger's own bootstrap row.
fn applied_records(records: Vec<MigrationRecord>) -> BTreeMap<i64, MigrationRecord> {
    records
        .into_iter()
        .filter(|r| r.version != BOOTSTRAP_VERSION)
        .map(|r| (r.version, r))
        .collect()
}

fn check_checksum(record: &MigrationRecord, migration: &Migration) -> DbResult<()> {
    if record.checksum != migration.checksum() {
        return Err(DbError::MigrationDrift {
            version: record.version,
            name: migration.name().to_string(),
            recorded: record.checksum.clone(),
            current: migration.checksum().to_string(),
        });
    }
    Ok(())
}

fn cancelled_report(direction: MigrationDirection) -> MigrationReport {
    let mut report = MigrationReport::new(direction);
    report.cancelled = true;
    report
}

fn log_outcome(result: &DbResult<MigrationReport>) {
    match result {
        Ok(report) => info!(
            direction = %report.direction,
            executed = report.executed.len(),
            last_completed = ?report.last_completed,
            cancelled = report.cancelled,
            "Migration run finished"
        ),
        Err(e) => warn!(error = %e, "Migration run failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::db::driver::DriverError;
    use crate::db::fake::FakeDriver;
    use crate::models::Row;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn ledger_row(version: i64, name: &str, checksum: &str) -> Row {
        match json!({
            "version": version,
            "name": name,
            "checksum": checksum,
            "applied_at": "2024-05-01T10:20:30Z"
        }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn locked_row(column: &str) -> Row {
        let mut row = Row::new();
        row.insert(column.to_string(), json!(true));
        row
    }

    fn set() -> MigrationSet {
        MigrationSet::new(vec![
            Migration::new(
                1,
                "create_t",
                vec!["CREATE TABLE t (id INT)".to_string()],
                Some(vec!["DROP TABLE t".to_string()]),
            ),
            Migration::new(2, "add_name", vec!["ALTER TABLE t ADD name TEXT".to_string()], None),
        ])
        .unwrap()
    }

    /// Postgres fake with the lock free and the given ledger rows.
    async fn setup(ledger: Vec<Row>) -> (FakeDriver, ConnectionPool) {
        let driver = FakeDriver::new();
        driver.set_rows("pg_try_advisory_lock", vec![locked_row("locked")]);
        driver.set_rows("pg_advisory_unlock", vec![locked_row("unlocked")]);
        driver.set_rows("ORDER BY version", ledger);
        driver.set_rows("WHERE version = $1", vec![ledger_row(0, "create_migration_ledger", "x")]);
        let config = PoolConfig {
            min_size: 0,
            max_size: 2,
            acquire_timeout: Duration::from_secs(1),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config)
            .await
            .unwrap();
        (driver, pool)
    }

    fn position(statements: &[String], needle: &str) -> usize {
        statements
            .iter()
            .position(|s| s.contains(needle))
            .unwrap_or_else(|| panic!("statement containing '{needle}' not issued"))
    }

    #[tokio::test]
    async fn test_migrate_up_runs_each_in_own_transaction() {
        let (driver, pool) = setup(vec![ledger_row(0, "create_migration_ledger", "x")]).await;
        let engine = MigrationEngine::new(set());

        let report = engine
            .migrate_up(&pool, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.executed, vec![1, 2]);
        assert_eq!(report.last_completed, Some(2));

        let statements = driver.statements();
        let lock = position(&statements, "pg_try_advisory_lock");
        let create = position(&statements, "CREATE TABLE t");
        let alter = position(&statements, "ALTER TABLE t");
        let unlock = position(&statements, "pg_advisory_unlock");
        assert!(lock < create && create < alter && alter < unlock);

        let commits = statements.iter().filter(|s| *s == "COMMIT").count();
        // Bootstrap plus one per migration
        assert_eq!(commits, 3);
        let inserts = statements
            .iter()
            .filter(|s| s.starts_with("INSERT INTO _schema_migrations "))
            .count();
        assert_eq!(inserts, 2);
    }

    #[tokio::test]
    async fn test_migrate_up_respects_target_and_skips_applied() {
        let set = set();
        let checksum = set.get(1).unwrap().checksum().to_string();
        let (driver, pool) = setup(vec![ledger_row(1, "create_t", &checksum)]).await;
        let engine = MigrationEngine::new(set);

        let report = engine
            .migrate_up(&pool, Some(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_noop());
        assert!(!driver.statements().iter().any(|s| s.contains("CREATE TABLE t ")));
    }

    #[tokio::test]
    async fn test_drift_stops_before_any_statement() {
        let (driver, pool) = setup(vec![ledger_row(1, "create_t", "stale")]).await;
        let engine = MigrationEngine::new(set());

        let err = engine
            .migrate_up(&pool, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::MigrationDrift { version: 1, .. }));
        assert!(err.requires_intervention());
        assert!(!driver.statements().iter().any(|s| s.contains("ALTER TABLE t")));

        let err = engine.status(&pool).await.unwrap_err();
        assert!(matches!(err, DbError::MigrationDrift { .. }));
    }

    #[tokio::test]
    async fn test_out_of_order_rejected_unless_allowed() {
        let set = set();
        let checksum = set.get(2).unwrap().checksum().to_string();
        let (_driver, pool) = setup(vec![ledger_row(2, "add_name", &checksum)]).await;

        let engine = MigrationEngine::new(set.clone());
        let err = engine
            .migrate_up(&pool, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::OutOfOrderMigration {
                version: 1,
                latest_applied: 2
            }
        ));

        let statuses = engine.status(&pool).await.unwrap();
        assert!(statuses[0].out_of_order);
        assert!(!statuses[0].applied);
        assert!(statuses[1].applied);

        let options = MigrationOptions::default().allow_out_of_order(true);
        let engine = MigrationEngine::with_options(set, options).unwrap();
        let report = engine
            .migrate_up(&pool, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.executed, vec![1]);
    }

    #[tokio::test]
    async fn test_failure_halts_and_names_version() {
        let (driver, pool) = setup(vec![ledger_row(0, "create_migration_ledger", "x")]).await;
        driver.fail_statements_matching(
            "ALTER TABLE t",
            DriverError::statement("syntax error", Some("42601".to_string())),
        );
        let engine = MigrationEngine::new(set());

        let err = engine
            .migrate_up(&pool, None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DbError::MigrationFailed { version, name, .. } => {
                assert_eq!(version, 2);
                assert_eq!(name, "add_name");
            }
            other => panic!("unexpected error: {other}"),
        }
        let statements = driver.statements();
        assert_eq!(statements.iter().filter(|s| *s == "ROLLBACK").count(), 1);
        // The lock is released even though the run failed
        assert!(statements.iter().any(|s| s.contains("pg_advisory_unlock")));
    }

    #[tokio::test]
    async fn test_table_lock_freed_after_connection_failure() {
        let driver = FakeDriver::with_dialect(crate::models::Dialect::Sqlite);
        driver.fail_statements_matching("CREATE TABLE t (", DriverError::connection("disk I/O error"));
        let config = PoolConfig {
            min_size: 0,
            max_size: 1,
            acquire_timeout: Duration::from_secs(1),
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config)
            .await
            .unwrap();
        let engine = MigrationEngine::new(set());

        let err = engine
            .migrate_up(&pool, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::MigrationFailed { version: 1, .. }));

        // The broken lease went back first, so the single slot served the unlock
        let statements = driver.statements();
        let failed = position(&statements, "CREATE TABLE t (");
        let unlock = position(&statements, "DELETE FROM _schema_migrations_lock");
        assert!(unlock > failed);
        assert_eq!(driver.opened_sessions(), 2);
        assert_eq!(pool.status().leased, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_migration() {
        let (driver, pool) = setup(vec![ledger_row(0, "create_migration_ledger", "x")]).await;
        let engine = MigrationEngine::new(set());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine.migrate_up(&pool, None, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(report.is_noop());
        assert!(!driver.statements().iter().any(|s| s.contains("CREATE TABLE t ")));
    }

    #[tokio::test]
    async fn test_migrate_down_validates_all_targets_first() {
        let set = set();
        let rows = vec![
            ledger_row(1, "create_t", set.get(1).unwrap().checksum()),
            ledger_row(2, "add_name", set.get(2).unwrap().checksum()),
        ];
        let (driver, pool) = setup(rows).await;
        let engine = MigrationEngine::new(set);

        let err = engine
            .migrate_down(&pool, 2, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::IrreversibleMigration { version: 2, .. }));
        assert!(!driver.statements().iter().any(|s| s == "DROP TABLE t"));
    }

    #[tokio::test]
    async fn test_migrate_down_reverts_latest() {
        let set = set();
        let rows = vec![ledger_row(1, "create_t", set.get(1).unwrap().checksum())];
        let (driver, pool) = setup(rows).await;
        let engine = MigrationEngine::new(set);

        let report = engine
            .migrate_down(&pool, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.direction, MigrationDirection::Down);
        assert_eq!(report.executed, vec![1]);

        let statements = driver.statements();
        let drop = position(&statements, "DROP TABLE t");
        let delete = position(&statements, "DELETE FROM _schema_migrations WHERE version");
        assert!(drop < delete);
    }

    #[tokio::test]
    async fn test_migrate_down_missing_source() {
        let (_driver, pool) = setup(vec![ledger_row(7, "vanished", "abc")]).await;
        let engine = MigrationEngine::new(set());

        let err = engine
            .migrate_down(&pool, 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::MissingMigration { version: 7, .. }));

        let statuses = engine.status(&pool).await.unwrap();
        let vanished = statuses.iter().find(|s| s.version == 7).unwrap();
        assert!(vanished.missing_source);
        assert!(vanished.applied);
    }

    #[tokio::test]
    async fn test_status_lists_pending() {
        let (_driver, pool) = setup(vec![ledger_row(0, "create_migration_ledger", "x")]).await;
        let engine = MigrationEngine::new(set());
        let statuses = engine.status(&pool).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| !s.applied && !s.out_of_order));
    }

    #[test]
    fn test_with_options_validates_table() {
        let options = MigrationOptions::default().with_ledger_table("bad-name");
        assert!(MigrationEngine::with_options(set(), options).is_err());
    }
}
