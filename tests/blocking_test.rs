//! Integration tests for the blocking adapter; these run outside any async runtime.

mod common;

use db_lifecycle::{BlockingPool, DbError, IsolationLevel, QueryParam};
use tempfile::NamedTempFile;

fn blocking_pool(file: &NamedTempFile) -> BlockingPool {
    common::init_tracing();
    let url = format!("{}?max_size=2", common::sqlite_url(file));
    BlockingPool::connect(&url).unwrap()
}

fn count(conn: &mut db_lifecycle::BlockingConnection) -> i64 {
    conn.query("SELECT COUNT(*) AS n FROM notes", &[])
        .unwrap()
        .scalar("n")
        .and_then(|v| v.as_i64())
        .unwrap()
}

#[test]
fn test_blocking_transaction_commit_and_rollback() {
    let file = NamedTempFile::new().unwrap();
    let pool = blocking_pool(&file);
    let mut conn = pool.acquire().unwrap();
    conn.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", &[])
        .unwrap();

    conn.transaction(IsolationLevel::default(), |tx| {
        tx.execute(
            "INSERT INTO notes (id, body) VALUES (?, ?)",
            &[QueryParam::from(1i64), QueryParam::from("kept")],
        )?;
        let sp = tx.savepoint("draft")?;
        tx.execute("INSERT INTO notes (id, body) VALUES (2, 'dropped')", &[])?;
        tx.rollback_to(&sp)
    })
    .unwrap();
    assert_eq!(count(&mut conn), 1);

    let err = conn
        .transaction(IsolationLevel::default(), |tx| {
            tx.execute("INSERT INTO notes (id, body) VALUES (3, 'gone')", &[])?;
            Err::<(), _>(DbError::invalid_input("abort the unit of work"))
        })
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(count(&mut conn), 1);
    assert!(pool.transactions().list_active().is_empty());

    conn.release();
    pool.close();
    assert!(pool.pool().is_closed());
}

#[test]
fn test_blocking_pool_status() {
    let file = NamedTempFile::new().unwrap();
    let pool = blocking_pool(&file);
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_eq!(pool.status().leased, 2);
    assert!(matches!(
        pool.acquire_timeout(std::time::Duration::from_millis(50)),
        Err(DbError::PoolTimeout { .. })
    ));
    a.release();
    b.release_broken();
    let status = pool.status();
    assert_eq!(status.leased, 0);
    assert!(status.idle >= 1);
    pool.close();
}
