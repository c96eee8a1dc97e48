//! The ledger table: one row per applied migration.

use crate::config::MigrationOptions;
use crate::db::connection::Connection;
use crate::db::transaction::{Transaction, TransactionManager};
use crate::error::{DbError, DbResult};
use crate::migrate::migration::Migration;
use crate::models::{MigrationRecord, QueryParam, Row};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

/// Ledger version recorded for the table's own creation.
pub const BOOTSTRAP_VERSION: i64 = 0;
pub const BOOTSTRAP_NAME: &str = "create_migration_ledger";

/// Create the ledger table and its version 0 record if either is missing.
///
/// Runs in its own transaction; the caller must hold the migration lock.
pub async fn bootstrap(
    conn: &mut Connection,
    transactions: &TransactionManager,
    options: &MigrationOptions,
) -> DbResult<()> {
    let dialect = conn.dialect();
    let table = options.ledger_table.as_str();
    let ddl = dialect.create_ledger_table(table);
    let bootstrap = Migration::new(BOOTSTRAP_VERSION, BOOTSTRAP_NAME, vec![ddl.clone()], None);

    let mut tx = transactions.begin(conn, options.isolation).await?;
    let result: DbResult<bool> = async {
        tx.execute(&ddl, &[]).await?;
        let existing = tx
            .query(
                &format!(
                    "SELECT version FROM {table} WHERE version = {}",
                    dialect.placeholder(1)
                ),
                &[QueryParam::Int(BOOTSTRAP_VERSION)],
            )
            .await?;
        if !existing.is_empty() {
            return Ok(false);
        }
        insert_record(&mut tx, table, &bootstrap).await?;
        Ok(true)
    }
    .await;

    match result {
        Ok(created) => {
            tx.commit().await?;
            if created {
                info!(ledger = table, "Migration ledger created");
            }
            Ok(())
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback of ledger bootstrap failed");
            }
            Err(e)
        }
    }
}

/// Every ledger row in version order, including the bootstrap record.
pub async fn read_records(conn: &mut Connection, table: &str) -> DbResult<Vec<MigrationRecord>> {
    let sql = conn.dialect().select_ledger(table);
    let result = conn.query(&sql, &[]).await?;
    result.rows.iter().map(parse_record).collect()
}

pub async fn insert_record(
    tx: &mut Transaction<'_>,
    table: &str,
    migration: &Migration,
) -> DbResult<()> {
    let sql = tx.dialect().insert_ledger_record(table);
    let params = [
        QueryParam::Int(migration.version()),
        QueryParam::String(migration.name().to_string()),
        QueryParam::String(migration.checksum().to_string()),
        QueryParam::Timestamp(Utc::now()),
    ];
    tx.execute(&sql, &params).await?;
    Ok(())
}

pub async fn delete_record(tx: &mut Transaction<'_>, table: &str, version: i64) -> DbResult<()> {
    let sql = tx.dialect().delete_ledger_record(table);
    let deleted = tx.execute(&sql, &[QueryParam::Int(version)]).await?;
    if deleted != 1 {
        return Err(DbError::internal(format!(
            "Expected to delete one ledger record for version {version}, deleted {deleted}"
        )));
    }
    Ok(())
}

fn parse_record(row: &Row) -> DbResult<MigrationRecord> {
    let version = row
        .get("version")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| malformed(row, "version"))?;
    let name = row
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| malformed(row, "name"))?;
    let checksum = row
        .get("checksum")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| malformed(row, "checksum"))?;
    let applied_at = row
        .get("applied_at")
        .and_then(JsonValue::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| malformed(row, "applied_at"))?;

    Ok(MigrationRecord {
        version,
        name: name.to_string(),
        checksum: checksum.trim_end().to_string(),
        applied_at,
    })
}

/// Accepts RFC 3339 and the naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` forms (read as UTC).
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

fn malformed(row: &Row, column: &str) -> DbError {
    DbError::internal(format!(
        "Malformed ledger row, bad '{column}': {}",
        JsonValue::Object(row.clone())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_record() {
        let record = parse_record(&row(json!({
            "version": 3,
            "name": "add_index",
            "checksum": "abc",
            "applied_at": "2024-05-01T10:20:30.123456+00:00"
        })))
        .unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.name, "add_index");
        assert_eq!(record.applied_at.timestamp(), 1714558830);
    }

    #[test]
    fn test_parse_record_rejects_missing_columns() {
        let err = parse_record(&row(json!({"version": 1, "name": "x"}))).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert!(parse_timestamp("2024-05-01T10:20:30Z").is_some());
        assert!(parse_timestamp("2024-05-01T10:20:30.5").is_some());
        assert!(parse_timestamp("2024-05-01 10:20:30").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
