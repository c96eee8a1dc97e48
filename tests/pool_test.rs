//! Integration tests for the connection pool against SQLite.

mod common;

use common::sqlite_pool;
use db_lifecycle::{DatabaseConfig, DbError, ConnectionPool, IsolationLevel, TransactionManager};
use std::time::Duration;

#[tokio::test]
async fn test_acquire_and_release_reuses_connection() {
    let (pool, _file) = sqlite_pool(1, 2).await;
    let status = pool.status();
    assert_eq!(status.size, 1);
    assert_eq!(status.idle, 1);

    let mut lease = pool.acquire().await.unwrap();
    let first_id = lease.id();
    let result = lease.query("SELECT 1 AS n", &[]).await.unwrap();
    assert_eq!(result.scalar("n"), Some(&serde_json::json!(1)));
    assert_eq!(pool.status().leased, 1);
    lease.release().await;

    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.id(), first_id);
    lease.release().await;
    assert_eq!(pool.status().idle, 1);
    pool.close().await;
}

#[tokio::test]
async fn test_exhausted_pool_times_out() {
    let (pool, _file) = sqlite_pool(0, 1).await;
    let held = pool.acquire().await.unwrap();

    let err = pool
        .acquire_timeout(Duration::from_millis(100))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DbError::PoolTimeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(pool.status().size, 1);

    held.release().await;
    let lease = pool.acquire_timeout(Duration::from_millis(100)).await.unwrap();
    lease.release().await;
    pool.close().await;
}

#[tokio::test]
async fn test_waiter_receives_released_connection() {
    let (pool, _file) = sqlite_pool(0, 1).await;
    let held = pool.acquire().await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let lease = pool.acquire().await?;
            let id = lease.id();
            lease.release().await;
            Ok::<_, DbError>(id)
        })
    };
    while pool.status().waiters == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    held.release().await;
    let served = waiter.await.unwrap().unwrap();
    assert_eq!(served, held_id);
    pool.close().await;
}

#[tokio::test]
async fn test_never_exceeds_max_size() {
    let (pool, _file) = sqlite_pool(0, 3).await;
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut lease = pool.acquire().await?;
            assert!(pool.status().size <= 3);
            lease.query("SELECT 1 AS n", &[]).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            lease.release().await;
            Ok::<_, DbError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    let status = pool.status();
    assert!(status.size <= 3);
    assert_eq!(status.leased, 0);
    pool.close().await;
}

#[tokio::test]
async fn test_broken_connection_is_discarded() {
    let (pool, _file) = sqlite_pool(0, 2).await;
    let lease = pool.acquire().await.unwrap();
    let broken_id = lease.id();
    lease.release_broken().await;
    assert_eq!(pool.status().size, 0);

    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.id(), broken_id);
    lease.release().await;
    pool.close().await;
}

#[tokio::test]
async fn test_connection_left_in_transaction_is_discarded() {
    let (pool, _file) = sqlite_pool(0, 1).await;
    let manager = TransactionManager::new();
    let mut lease = pool.acquire().await.unwrap();
    let leaked_id = lease.id();

    {
        let mut tx = manager
            .begin(&mut lease, IsolationLevel::default())
            .await
            .unwrap();
        tx.execute("CREATE TABLE leaked (id INTEGER)", &[]).await.unwrap();
        // Dropped without commit or rollback
    }
    assert!(lease.in_transaction());
    lease.release().await;

    let mut lease = pool.acquire().await.unwrap();
    assert_ne!(lease.id(), leaked_id);
    // The uncommitted table never became visible
    let tables = lease
        .query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'leaked'",
            &[],
        )
        .await
        .unwrap();
    assert!(tables.is_empty());
    lease.release().await;
    pool.close().await;
}

#[tokio::test]
async fn test_close_rejects_new_and_queued_acquires() {
    let (pool, _file) = sqlite_pool(1, 1).await;
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
    };
    while pool.status().waiters == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let closer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.close().await })
    };
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::PoolClosed));
    assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));

    held.release().await;
    closer.await.unwrap();
    assert!(pool.is_closed());
    assert_eq!(pool.status().size, 0);

    // Idempotent
    pool.close().await;
}

#[tokio::test]
async fn test_connect_from_url_options() {
    common::init_tracing();
    let file = tempfile::NamedTempFile::new().unwrap();
    let url = format!("{}?max_size=2&min_size=0", common::sqlite_url(&file));
    let config = DatabaseConfig::parse(&url).unwrap();

    let pool = ConnectionPool::connect(&config, None).await.unwrap();
    assert_eq!(pool.config().max_size, 2);
    assert_eq!(pool.status().size, 0);

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    assert_eq!(pool.status().size, 2);
    a.release().await;
    b.release().await;
    pool.close().await;
}
