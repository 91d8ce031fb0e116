//! Integration tests for the connection pool lifecycle.
//!
//! Tests verify that:
//! - Concurrent borrowers never push the pool past its maximum size
//! - Idle and overdue connections are evicted by the sweep
//! - Shutdown and restart leave the pool in a usable state

use rand::Rng;
use rowbase::config::PoolSettings;
use rowbase::db::ConnectionPool;
use rowbase::error::DbError;
use rowbase::models::{ConnectionConfig, ConnectionState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn file_config(dir: &TempDir, settings: PoolSettings) -> ConnectionConfig {
    let path = dir.path().join("pool.db");
    ConnectionConfig::new(format!("sqlite:{}", path.display()), settings).unwrap()
}

fn settings(min: usize, max: usize, sweep_ms: u64) -> PoolSettings {
    PoolSettings {
        min_pool_size: Some(min),
        max_pool_size: Some(max),
        sweep_period_ms: Some(sweep_ms),
        acquire_timeout_ms: Some(5000),
        ..PoolSettings::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_borrowers_stay_within_max() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(
        ConnectionPool::connect(file_config(&dir, settings(1, 3, 10)))
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            let mut completed = 0;
            while completed < 5 {
                match pool.acquire().await {
                    Ok(mut conn) => {
                        assert!(pool.total_count() <= 3);
                        assert!(conn.connection().unwrap().ping().await);
                        let hold = rand::thread_rng().gen_range(1..8);
                        tokio::time::sleep(Duration::from_millis(hold)).await;
                        conn.release();
                        completed += 1;
                    }
                    Err(DbError::PoolExhausted { max, .. }) => {
                        assert_eq!(max, 3);
                        let backoff = rand::thread_rng().gen_range(1..5);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                    Err(e) => panic!("unexpected acquire error: {e}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(pool.total_count() <= 3);
    let stats = pool.statistics();
    assert!(stats.opened <= 3 + stats.expired_idle + stats.expired_lifetime + stats.invalid);
    assert!(stats.sweep_runs > 0);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_keeps_idle_connections_borrowable() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(
        ConnectionPool::connect(file_config(&dir, settings(8, 8, 60_000)))
            .await
            .unwrap(),
    );
    assert_eq!(pool.available_count(), 8);

    for _ in 0..50 {
        let sweeper = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.sweep().await })
        };
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().await.unwrap());
        }
        sweeper.await.unwrap().unwrap();
        drop(held);
        pool.sweep().await.unwrap();
        assert_eq!(pool.available_count(), 8);
    }

    // Healthy idle connections were always on hand, so nobody had to wait
    let stats = pool.statistics();
    assert_eq!(stats.exhausted_blocking, 0);
    assert_eq!(stats.invalid, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_idle_connections_evicted() {
    let dir = TempDir::new().unwrap();
    let mut s = settings(0, 2, 60_000);
    s.max_idle_time_ms = Some(20);
    let pool = ConnectionPool::connect(file_config(&dir, s)).await.unwrap();
    assert_eq!(pool.total_count(), 0);

    let conn = pool.acquire().await.unwrap();
    conn.release();
    pool.sweep().await.unwrap();
    assert_eq!(pool.loaned_count(), 0);

    tokio::time::sleep(Duration::from_millis(40)).await;
    pool.sweep().await.unwrap();
    assert_eq!(pool.available_count(), 0);
    assert!(pool.statistics().expired_idle >= 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_overdue_loan_is_revoked() {
    let dir = TempDir::new().unwrap();
    let mut s = settings(1, 2, 60_000);
    s.max_loan_time_ms = Some(10);
    let pool = ConnectionPool::connect(file_config(&dir, s)).await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    tokio::time::sleep(Duration::from_millis(25)).await;
    pool.sweep().await.unwrap();

    let snapshot = pool.connections();
    let entry = snapshot.iter().find(|c| c.id == conn.id()).unwrap();
    assert_eq!(entry.state, ConnectionState::Closing);
    assert!(entry.loaned_for_ms.unwrap() >= 10);

    let err = conn.connection().unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    assert!(err.is_retryable());
    drop(conn);

    // The revoked slot is freed once the guard is gone
    assert_eq!(pool.loaned_count(), 0);
    assert!(pool.total_count() <= 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_acquire_times_out_when_nothing_opens() {
    let dir = TempDir::new().unwrap();
    let mut s = settings(1, 2, 60_000);
    s.acquire_timeout_ms = Some(50);
    let pool = ConnectionPool::connect(file_config(&dir, s)).await.unwrap();

    let _first = pool.acquire().await.unwrap();
    // Remove the database directory so new connections cannot be opened
    let path = dir.path().to_path_buf();
    drop(dir);
    assert!(!path.exists());

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_then_restart() {
    let dir = TempDir::new().unwrap();
    let pool = ConnectionPool::connect(file_config(&dir, settings(2, 4, 60_000)))
        .await
        .unwrap();
    let held = pool.acquire().await.unwrap();
    assert_eq!(pool.loaned_count(), 1);

    let stats = pool.restart().await.unwrap();
    assert_eq!(stats.opened, 2);
    assert!(!pool.is_closed());
    assert_eq!(pool.available_count(), 2);
    assert_eq!(pool.statistics().opened, 2);

    // A guard from before the restart is closed, not pooled
    drop(held);
    pool.sweep().await.unwrap();
    assert_eq!(pool.loaned_count(), 0);
    assert_eq!(pool.available_count(), 2);

    let final_stats = pool.shutdown().await;
    assert_eq!(final_stats.returned, 0);
    assert!(pool.is_closed());
    assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
}

#[tokio::test]
async fn test_invalid_url_fails_connect() {
    let settings = PoolSettings {
        min_pool_size: Some(1),
        ..PoolSettings::default()
    };
    let config =
        ConnectionConfig::new("sqlite:/nonexistent-dir/rowbase/pool.db", settings).unwrap();
    let err = ConnectionPool::connect(config).await.unwrap_err();
    assert!(err.is_retryable() || matches!(err, DbError::Connection { .. } | DbError::Database { .. }));
}
