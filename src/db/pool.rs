//! Bounded connection pool handing out connection promises.
//!
//! At most `max_connections` physical connections are open at once; each one
//! in use holds a semaphore permit. Released connections go back to an idle
//! list and are reused by later `get()` calls. A background task destroys
//! idle connections that outlive the idle timeout.

use crate::config::PoolOptions;
use crate::db::capability::DriverConnection;
use crate::db::connection::ConnectionPromise;
use crate::db::registry::Driver;
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open physical connections, idle or in use.
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

struct IdleConnection {
    conn: Box<dyn DriverConnection>,
    since: Instant,
}

struct PoolInner {
    driver: Driver,
    connection_string: String,
    max_connections: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    size: AtomicUsize,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the most recently returned idle connection, destroying any that
    /// expired on the way.
    fn pop_idle(&self) -> Option<Box<dyn DriverConnection>> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let found = {
            let mut idle = self.idle();
            loop {
                match idle.pop_back() {
                    Some(entry) if now.saturating_duration_since(entry.since) > self.idle_timeout => {
                        expired.push(entry.conn);
                    }
                    Some(entry) => break Some(entry.conn),
                    None => break None,
                }
            }
        };
        for conn in expired {
            self.destroy(conn);
        }
        found
    }

    fn push_idle(&self, conn: Box<dyn DriverConnection>) {
        if self.closed.load(Ordering::Acquire) {
            self.destroy(conn);
            return;
        }
        self.idle().push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }

    fn destroy(&self, conn: Box<dyn DriverConnection>) {
        self.size.fetch_sub(1, Ordering::AcqRel);
        let capability = self.driver.capability().clone();
        // Without a runtime (pool dropped after shutdown) the connection is just dropped
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                capability.close(conn).await;
            });
        }
    }

    /// Destroy idle connections unused for longer than the idle timeout.
    fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut idle = self.idle();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = idle
                .drain(..)
                .partition(|entry| now.saturating_duration_since(entry.since) <= self.idle_timeout);
            *idle = keep;
            expired.into_iter().map(|entry| entry.conn).collect()
        };
        let count = expired.len();
        for conn in expired {
            self.destroy(conn);
        }
        count
    }

    async fn acquire(
        self: Arc<Self>,
        slot: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
    ) -> DbResult<Box<dyn DriverConnection>> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            DbError::timeout(
                "connection pool acquire",
                self.acquire_timeout.as_secs() as u32,
            )
        })?
        .map_err(|_| pool_closed())?;

        let conn = match self.pop_idle() {
            Some(conn) => {
                debug!(driver = %self.driver.name(), "Reusing idle connection");
                conn
            }
            None => {
                let conn = self
                    .driver
                    .capability()
                    .connect(&self.connection_string)
                    .await?;
                self.size.fetch_add(1, Ordering::AcqRel);
                debug!(driver = %self.driver.name(), "Opened pooled connection");
                conn
            }
        };

        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(permit);
        Ok(conn)
    }
}

fn pool_closed() -> DbError {
    DbError::connection("Connection pool is closed", "Create a new pool")
}

/// Pool of physical connections behind [`ConnectionPromise`]s.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool. Must be called inside a Tokio runtime; connections are
    /// opened lazily by `get()`.
    pub fn new(
        driver: Driver,
        connection_string: impl Into<String>,
        options: PoolOptions,
    ) -> DbResult<Self> {
        options.validate()?;
        let connection_string = connection_string.into();
        let is_sqlite = DatabaseType::from_connection_string(&connection_string)
            == Some(DatabaseType::SQLite);
        let max_connections = options.max_connections_or_default(is_sqlite) as usize;

        let inner = Arc::new(PoolInner {
            driver,
            connection_string,
            max_connections,
            idle_timeout: options.idle_timeout_or_default(),
            acquire_timeout: options.acquire_timeout_or_default(),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(VecDeque::new()),
            size: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let cleanup = tokio::spawn(Self::cleanup_task(
            Arc::downgrade(&inner),
            options.cleanup_interval_or_default(),
        ));

        info!(
            driver = %inner.driver.name(),
            max_connections,
            idle_timeout_secs = inner.idle_timeout.as_secs(),
            "Created connection pool"
        );

        Ok(Self {
            inner,
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    /// Hand out a connection immediately. The physical connection resolves
    /// once a slot is free: an idle one is reused, otherwise a new one opens.
    ///
    /// Releasing the promise returns the connection to the pool; closing it
    /// destroys the connection and frees its slot.
    pub fn get(&self) -> ConnectionPromise {
        let slot: Arc<Mutex<Option<OwnedSemaphorePermit>>> = Arc::new(Mutex::new(None));
        let resolution = self.inner.clone().acquire(slot.clone());

        let release = {
            let inner = self.inner.clone();
            let slot = slot.clone();
            move |conn: Box<dyn DriverConnection>| {
                inner.push_idle(conn);
                slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            }
        };
        let destroy = {
            let inner = self.inner.clone();
            move |conn: Box<dyn DriverConnection>| {
                inner.destroy(conn);
                slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            }
        };

        ConnectionPromise::new(self.inner.driver.clone(), resolution, release, destroy)
    }

    pub fn driver(&self) -> &Driver {
        &self.inner.driver
    }

    pub fn status(&self) -> PoolStatus {
        let size = self.inner.size.load(Ordering::Acquire);
        let idle = self.inner.idle().len();
        PoolStatus {
            size,
            idle,
            in_use: size.saturating_sub(idle),
            max: self.inner.max_connections,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Destroy idle connections past the idle timeout now.
    pub fn evict_idle(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Close the pool: idle connections are destroyed, connections in use
    /// are destroyed when released, and later `get()`s fail.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        if let Some(handle) = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let idle: Vec<_> = self.inner.idle().drain(..).collect();
        let count = idle.len();
        for entry in idle {
            self.inner.destroy(entry.conn);
        }
        info!(
            driver = %self.inner.driver.name(),
            destroyed = count,
            "Closed connection pool"
        );
    }

    /// Background task that evicts idle connections.
    ///
    /// Runs until the pool is dropped (detected via Weak reference).
    async fn cleanup_task(weak_pool: Weak<PoolInner>, cleanup_interval: Duration) {
        let mut interval = tokio::time::interval(cleanup_interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                debug!("Connection pool dropped, cleanup task exiting");
                return;
            };

            let evicted = pool.evict_expired();
            if evicted > 0 {
                debug!(
                    driver = %pool.driver.name(),
                    evicted,
                    "Destroyed expired idle connections"
                );
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if !self.is_closed() {
            let status = self.status();
            if status.in_use > 0 {
                warn!(
                    driver = %self.inner.driver.name(),
                    in_use = status.in_use,
                    "Connection pool dropped with connections in use"
                );
            }
            self.close();
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &self.inner.driver.name())
            .field("status", &self.status())
            .finish()
    }
}
