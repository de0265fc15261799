//! Integration tests for the connection pool.

use anysql::config::PoolOptions;
use anysql::db::memory::ScriptedCapability;
use anysql::db::{self, ConnectionPool, ConnectionState, Driver};
use anysql::error::DbError;
use std::sync::Arc;
use std::time::Duration;

fn pool(cap: &ScriptedCapability, options: PoolOptions) -> ConnectionPool {
    Driver::new("scripted", Arc::new(cap.clone()))
        .pool("memory://", options)
        .unwrap()
}

/// Poll `check` until it holds, failing after about three seconds.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..600 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let cap = ScriptedCapability::new();
    let pool = pool(&cap, PoolOptions::default().with_max_connections(2));

    let first = pool.get();
    first.exec("SELECT 1").unwrap().then().unwrap().await.unwrap();
    first.release();
    eventually(|| pool.status().idle == 1).await;

    let second = pool.get();
    second.exec("SELECT 2").unwrap().then().unwrap().await.unwrap();

    assert_eq!(cap.opened(), 1);
    let recorded = cap.recorded();
    assert_eq!(recorded[0].connection, recorded[1].connection);
    assert_eq!(pool.status().in_use, 1);
}

#[tokio::test]
async fn test_get_waits_for_free_slot() {
    let cap = ScriptedCapability::new();
    let pool = pool(&cap, PoolOptions::default().with_max_connections(1));

    let holder = pool.get();
    holder.exec("SELECT held").unwrap().then().unwrap().await.unwrap();

    let waiter = pool.get();
    let waiting = waiter.exec("SELECT waiting").unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiting.is_done());
    assert_eq!(waiter.state(), ConnectionState::AwaitingConnection);

    holder.release();
    waiting.then().unwrap().await.unwrap();
    assert_eq!(cap.opened(), 1);
    assert_eq!(
        pool.status(),
        anysql::db::PoolStatus {
            size: 1,
            idle: 0,
            in_use: 1,
            max: 1
        }
    );
}

#[tokio::test]
async fn test_close_destroys_connection_and_frees_slot() {
    let cap = ScriptedCapability::new();
    let pool = pool(&cap, PoolOptions::default().with_max_connections(1));

    let conn = pool.get();
    conn.exec("SELECT 1").unwrap().then().unwrap().await.unwrap();
    conn.close();
    eventually(|| cap.closed() == 1).await;
    assert_eq!(pool.status().size, 0);

    let next = pool.get();
    next.exec("SELECT 2").unwrap().then().unwrap().await.unwrap();
    assert_eq!(cap.opened(), 2);
}

#[tokio::test]
async fn test_release_before_resolution_returns_connection() {
    let cap = ScriptedCapability::new().with_connect_delay(Duration::from_millis(30));
    let pool = pool(&cap, PoolOptions::default().with_max_connections(1));

    let conn = pool.get();
    conn.release();
    assert_eq!(conn.state(), ConnectionState::Released);

    eventually(|| pool.status().idle == 1).await;
    assert_eq!(pool.status().in_use, 0);

    // The returned connection and its slot are usable
    let next = pool.get();
    next.exec("SELECT 1").unwrap().then().unwrap().await.unwrap();
    assert_eq!(cap.opened(), 1);
}

#[tokio::test]
async fn test_close_before_resolution_destroys_connection() {
    let cap = ScriptedCapability::new().with_connect_delay(Duration::from_millis(30));
    let pool = pool(&cap, PoolOptions::default().with_max_connections(1));

    pool.get().close();
    eventually(|| cap.closed() == 1).await;
    assert_eq!(pool.status().size, 0);
    assert_eq!(pool.status().idle, 0);
}

#[tokio::test]
async fn test_connect_failure_frees_slot() {
    let cap = ScriptedCapability::new().failing_connect(DbError::connection("refused", "retry"));
    let pool = pool(&cap, PoolOptions::default().with_max_connections(1));

    let broken = pool.get();
    eventually(|| broken.state() == ConnectionState::Paused).await;
    assert!(matches!(broken.error(), Some(DbError::Connection { .. })));
    assert_eq!(pool.status().size, 0);

    let again = pool.get();
    eventually(|| again.state() == ConnectionState::Paused).await;
}

#[tokio::test]
async fn test_acquire_timeout() {
    let cap = ScriptedCapability::new();
    let options = PoolOptions {
        max_connections: Some(1),
        acquire_timeout_secs: Some(1),
        ..PoolOptions::default()
    };
    let pool = pool(&cap, options);

    let holder = pool.get();
    holder.exec("SELECT 1").unwrap().then().unwrap().await.unwrap();

    let starved = pool.get();
    eventually(|| starved.state() == ConnectionState::Paused).await;
    assert!(matches!(starved.error(), Some(DbError::Timeout { .. })));
}

#[tokio::test]
async fn test_idle_eviction() {
    let cap = ScriptedCapability::new();
    let pool = pool(&cap, PoolOptions::default().with_idle_timeout_secs(0));

    let conn = pool.get();
    conn.exec("SELECT 1").unwrap().then().unwrap().await.unwrap();
    conn.release();
    eventually(|| pool.status().idle == 1).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(pool.evict_idle(), 1);
    eventually(|| cap.closed() == 1).await;
    assert_eq!(pool.status().size, 0);
}

#[tokio::test]
async fn test_cleanup_task_evicts_idle_connections() {
    let cap = ScriptedCapability::new();
    let options = PoolOptions {
        idle_timeout_secs: Some(0),
        cleanup_interval_secs: Some(1),
        ..PoolOptions::default()
    };
    let pool = pool(&cap, options);

    let conn = pool.get();
    conn.exec("SELECT 1").unwrap().then().unwrap().await.unwrap();
    conn.release();

    eventually(|| cap.closed() == 1).await;
    assert_eq!(pool.status().idle, 0);
}

#[tokio::test]
async fn test_closed_pool_rejects_get() {
    let cap = ScriptedCapability::new();
    let pool = pool(&cap, PoolOptions::default());

    let conn = pool.get();
    conn.exec("SELECT 1").unwrap().then().unwrap().await.unwrap();
    pool.close();
    assert!(pool.is_closed());

    // In-use connection is destroyed when released after close
    conn.release();
    eventually(|| cap.closed() == 1).await;

    let late = pool.get();
    eventually(|| late.state() == ConnectionState::Paused).await;
    assert!(matches!(late.error(), Some(DbError::Connection { .. })));
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let cap = ScriptedCapability::new();
    let result = Driver::new("scripted", Arc::new(cap))
        .pool("memory://", PoolOptions::default().with_max_connections(0));
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
}

#[tokio::test]
async fn test_sqlite_pool_from_url() {
    db::register_builtin_drivers();
    let pool = db::pool("sqlite::memory:?idle_timeout=30").unwrap();
    assert_eq!(pool.status().max, 1);
    assert_eq!(pool.driver().name(), "sqlite");

    let conn = pool.get();
    let value = conn
        .exec("SELECT 40 + 2 AS answer")
        .unwrap()
        .scalar()
        .unwrap()
        .await;
    assert_eq!(value, Some(serde_json::json!(42)));
    conn.release();
    eventually(|| pool.status().idle == 1).await;
}
