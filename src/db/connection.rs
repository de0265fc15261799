//! Connection promises.
//!
//! A [`ConnectionPromise`] can be used the moment it is created, before the
//! physical connection exists. Every operation is synchronous: it updates the
//! queue state under a short lock and wakes the connection's runner task,
//! which owns the physical connection and executes statements one at a time
//! in submission order.

use crate::db::capability::DriverConnection;
use crate::db::cursor::Cursor;
use crate::db::queue::{
    ConnectionState, Effects, QueueState, ReleaseMode, Restored, Statement, Step,
};
use crate::db::registry::Driver;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, QueryParam};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Future resolving to the physical connection.
pub type ConnectionFuture =
    Pin<Box<dyn Future<Output = DbResult<Box<dyn DriverConnection>>> + Send>>;

/// Receives the physical connection when a promise is released or closed.
pub type ConnectionAction = Box<dyn FnOnce(Box<dyn DriverConnection>) + Send>;

struct Shared {
    id: String,
    driver: Driver,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Carry out transition effects outside the state lock, so callbacks may
    /// call back into the connection.
    fn apply(self: &Arc<Self>, effects: Effects) {
        let Effects {
            ready,
            error,
            resolved,
            retired,
        } = effects;
        for (statement, err) in resolved {
            statement.sink.finish(Err(err));
        }
        if let Some(cb) = ready {
            cb();
        }
        if let Some((mut cb, mut err)) = error {
            let conn = ConnectionRef {
                shared: self.clone(),
            };
            loop {
                cb(&conn, &err);
                let restored = self.lock().restore_error_callback(cb);
                match restored {
                    Restored::Fire(next, next_err) => {
                        cb = next;
                        err = next_err;
                    }
                    Restored::Stored | Restored::Retired(_) => break,
                }
            }
        }
        drop(retired);
    }

    fn release(self: &Arc<Self>, mode: ReleaseMode) {
        let effects = self.lock().release(mode);
        if let Some(effects) = effects {
            if !effects.resolved.is_empty() {
                warn!(
                    connection_id = %self.id,
                    discarded = effects.resolved.len(),
                    "Discarding queued statements on release"
                );
            }
            self.apply(effects);
            self.wake.notify_one();
        }
    }
}

/// Last-handle guard; dropping it releases the connection.
struct Handle {
    conn: ConnectionRef,
}

impl Drop for Handle {
    fn drop(&mut self) {
        let shared = &self.conn.shared;
        if !shared.lock().is_released() {
            debug!(
                connection_id = %shared.id,
                "Connection dropped without release, releasing"
            );
            shared.release(ReleaseMode::Release);
        }
    }
}

/// A connection that may not have resolved yet.
///
/// Cloning is cheap and every clone drives the same queue. Dropping the last
/// clone releases the connection. Every operation of [`ConnectionRef`] is
/// available through deref. Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct ConnectionPromise {
    handle: Arc<Handle>,
}

/// Non-owning view of a connection, handed to error callbacks.
///
/// A `ConnectionRef` does not keep the connection from being released when
/// the last [`ConnectionPromise`] is dropped. Callbacks should use it
/// instead of capturing a promise clone: a captured promise keeps the
/// connection open until `release()` or `close()` is called explicitly.
#[derive(Clone)]
pub struct ConnectionRef {
    shared: Arc<Shared>,
}

impl ConnectionPromise {
    /// Create a promise over a pending physical connection.
    ///
    /// `release` hands the connection back to its provider and `destroy`
    /// tears it down. Exactly one of them fires, once, after the promise is
    /// released or closed and the connection has resolved. Neither fires if
    /// the connection failed.
    pub fn new<F, R, D>(driver: Driver, resolution: F, release: R, destroy: D) -> Self
    where
        F: Future<Output = DbResult<Box<dyn DriverConnection>>> + Send + 'static,
        R: FnOnce(Box<dyn DriverConnection>) + Send + 'static,
        D: FnOnce(Box<dyn DriverConnection>) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            id: uuid::Uuid::new_v4().to_string(),
            driver,
            state: Mutex::new(QueueState::new()),
            wake: Notify::new(),
        });

        tokio::spawn(run(
            shared.clone(),
            Box::pin(resolution),
            Box::new(release),
            Box::new(destroy),
        ));

        Self {
            handle: Arc::new(Handle {
                conn: ConnectionRef { shared },
            }),
        }
    }

    /// A view of this connection that does not keep it alive.
    pub fn connection_ref(&self) -> ConnectionRef {
        self.handle.conn.clone()
    }
}

impl Deref for ConnectionPromise {
    type Target = ConnectionRef;

    fn deref(&self) -> &ConnectionRef {
        &self.handle.conn
    }
}

impl ConnectionRef {
    fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Unique id used in log fields.
    pub fn id(&self) -> &str {
        &self.shared().id
    }

    pub fn driver(&self) -> &Driver {
        &self.shared().driver
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().lock().state()
    }

    pub fn in_transaction(&self) -> bool {
        self.shared().lock().in_transaction()
    }

    /// Statements waiting behind the pending one.
    pub fn queued(&self) -> usize {
        self.shared().lock().queued()
    }

    /// The error currently pausing the queue.
    pub fn error(&self) -> Option<DbError> {
        self.shared().lock().error().cloned()
    }

    /// Schedule a statement without parameters.
    pub fn exec(&self, sql: impl Into<String>) -> DbResult<Cursor> {
        self.exec_with(sql, Vec::new())
    }

    /// Schedule a parameterized statement. Placeholders use `?`.
    pub fn exec_with(
        &self,
        sql: impl Into<String>,
        params: impl Into<Vec<QueryParam>>,
    ) -> DbResult<Cursor> {
        let sql = sql.into();
        if sql.trim().is_empty() {
            return Err(DbError::usage("SQL statement must not be empty"));
        }
        let (statement, cursor) = Statement::new(sql, params.into());
        self.shared().lock().enqueue(statement)?;
        self.shared().wake.notify_one();
        Ok(cursor)
    }

    /// Start a transaction, optionally at an isolation level. Returns the
    /// cursor of the last statement the dialect needs.
    pub fn begin(&self, level: Option<IsolationLevel>) -> DbResult<Cursor> {
        let sqls = self.driver().capability().begin(level);
        let mut cursor = None;
        let mut statements = Vec::with_capacity(sqls.len());
        for sql in sqls {
            let (statement, c) = Statement::new(sql, Vec::new());
            statements.push(statement);
            cursor = Some(c);
        }
        let cursor = cursor.ok_or_else(|| {
            DbError::internal(format!(
                "Driver '{}' produced no statements to begin a transaction",
                self.driver().name()
            ))
        })?;

        self.shared().lock().begin(statements)?;
        self.shared().wake.notify_one();
        Ok(cursor)
    }

    pub fn commit(&self) -> DbResult<Cursor> {
        let (statement, cursor) = Statement::new(self.driver().capability().commit(), Vec::new());
        self.shared().lock().commit(statement)?;
        self.shared().wake.notify_one();
        Ok(cursor)
    }

    /// Create savepoint `name`.
    pub fn save(&self, name: &str) -> DbResult<Cursor> {
        validate_savepoint(name)?;
        self.exec(self.driver().capability().save(name))
    }

    /// Roll back the transaction, or to savepoint `name`.
    ///
    /// On a paused connection every statement queued so far is discarded
    /// and the error is cleared before the rollback is queued.
    pub fn rollback(&self, name: Option<&str>) -> DbResult<Cursor> {
        if let Some(name) = name {
            validate_savepoint(name)?;
        }
        let sql = self.driver().capability().rollback(name);
        let (statement, cursor) = Statement::new(sql, Vec::new());
        let effects = self
            .shared()
            .lock()
            .rollback(statement, name.is_some())?;
        if !effects.resolved.is_empty() {
            warn!(
                connection_id = %self.id(),
                discarded = effects.resolved.len(),
                "Rollback discarded statements queued after an error"
            );
        }
        self.shared().apply(effects);
        self.shared().wake.notify_one();
        Ok(cursor)
    }

    /// Clear the error pausing the queue. With `reset`, statements queued
    /// so far are discarded instead of run.
    pub fn resume(&self, reset: bool) -> DbResult<()> {
        let effects = self.shared().lock().resume(reset)?;
        debug!(
            connection_id = %self.id(),
            reset,
            discarded = effects.resolved.len(),
            "Resuming connection"
        );
        self.shared().apply(effects);
        self.shared().wake.notify_one();
        Ok(())
    }

    /// Hand the connection back to its provider. Idempotent.
    pub fn release(&self) {
        self.shared().release(ReleaseMode::Release);
    }

    /// Destroy the physical connection. Idempotent.
    pub fn close(&self) {
        self.shared().release(ReleaseMode::Destroy);
    }

    /// Run `cb` once the connection first resolves successfully, or now if
    /// it already has.
    pub fn on_ready(&self, cb: impl FnOnce() + Send + 'static) {
        let fire = self.shared().lock().set_ready_callback(Box::new(cb));
        if let Some(cb) = fire {
            cb();
        }
    }

    /// Run `cb` for every unhandled connection error, including one that
    /// has already occurred. The callback receives a view of the connection
    /// it may call back into.
    pub fn on_error(&self, cb: impl FnMut(&ConnectionRef, &DbError) + Send + 'static) {
        let fire = self.shared().lock().set_error_callback(Box::new(cb));
        if let Some(pair) = fire {
            self.shared().apply(Effects {
                error: Some(pair),
                ..Effects::default()
            });
        }
    }
}

impl fmt::Debug for ConnectionPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.handle.conn, f)
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("driver", &self.driver().name())
            .field("state", &self.state())
            .finish()
    }
}

fn validate_savepoint(name: &str) -> DbResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::usage(format!(
            "Invalid savepoint name '{name}': use letters, digits and underscores"
        )));
    }
    Ok(())
}

/// Owns the physical connection and executes the queue.
async fn run(
    shared: Arc<Shared>,
    resolution: ConnectionFuture,
    release: ConnectionAction,
    destroy: ConnectionAction,
) {
    let capability = shared.driver.capability().clone();

    let mut conn = match resolution.await {
        Ok(conn) => {
            info!(
                connection_id = %shared.id,
                driver = %shared.driver.name(),
                "Connection ready"
            );
            let effects = shared.lock().on_connected();
            shared.apply(effects);
            Some(conn)
        }
        Err(err) => {
            warn!(
                connection_id = %shared.id,
                driver = %shared.driver.name(),
                error = %capability.error_message(&err),
                "Connection failed, pausing"
            );
            let effects = shared.lock().on_connect_failed(err);
            shared.apply(effects);
            None
        }
    };

    loop {
        let step = shared.lock().next_step();
        match step {
            Step::Run(statement) => {
                debug!(connection_id = %shared.id, sql = %statement.sql, "Executing statement");
                let result = match conn.as_deref_mut() {
                    Some(c) => {
                        capability
                            .execute(c, &statement.sql, &statement.params, &statement.sink)
                            .await
                    }
                    None => Err(DbError::internal("Statement scheduled without a connection")),
                };
                let result = result.map_err(|cause| {
                    warn!(
                        connection_id = %shared.id,
                        sql = %statement.sql,
                        error = %capability.error_message(&cause),
                        "Statement failed, pausing connection"
                    );
                    DbError::statement(&statement.sql, &statement.params, cause)
                });
                debug!(
                    connection_id = %shared.id,
                    row_count = statement.sink.row_count(),
                    ok = result.is_ok(),
                    "Statement finished"
                );

                let effects = shared.lock().on_statement_finished(&result);
                statement.sink.finish(result);
                shared.apply(effects);
            }
            Step::Fail(statement, err) => {
                debug!(
                    connection_id = %shared.id,
                    sql = %statement.sql,
                    "Resolving statement with connection error"
                );
                statement.sink.finish(Err(err));
            }
            Step::Wait => shared.wake.notified().await,
            Step::Shutdown(mode) => {
                match conn.take() {
                    Some(conn) => match mode {
                        ReleaseMode::Release => release(conn),
                        ReleaseMode::Destroy => destroy(conn),
                    },
                    None => debug!(connection_id = %shared.id, "No connection to hand back"),
                }
                info!(connection_id = %shared.id, ?mode, "Connection released");
                return;
            }
        }
    }
}
