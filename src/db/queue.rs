//! Statement queue state for one connection.
//!
//! [`QueueState`] holds everything a connection knows about its queue and
//! changes only through the named transition methods below. It performs no
//! I/O: transitions return [`Step`]s for the runner and [`Effects`] (callbacks
//! and statements to resolve) that the caller carries out after releasing
//! the lock.

use crate::db::connection::ConnectionRef;
use crate::db::cursor::{Cursor, RowSink};
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// The physical connection has not resolved yet.
    AwaitingConnection,
    /// Statements execute as they reach the head of the queue.
    Ready,
    /// An unhandled error holds the queue until `resume` or `rollback`.
    Paused,
    /// Terminal; no statement may be scheduled or executed.
    Released,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingConnection => "awaiting_connection",
            Self::Ready => "ready",
            Self::Paused => "paused",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// One queued unit of work.
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub(crate) sink: RowSink,
}

impl Statement {
    pub(crate) fn new(sql: impl Into<String>, params: Vec<QueryParam>) -> (Statement, Cursor) {
        let (cursor, sink) = Cursor::channel();
        let statement = Statement {
            sql: sql.into(),
            params,
            sink,
        };
        (statement, cursor)
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .finish()
    }
}

/// How the physical connection is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseMode {
    /// Return it to its provider.
    Release,
    /// Destroy it outright.
    Destroy,
}

pub(crate) type ReadyCallback = Box<dyn FnOnce() + Send>;
pub(crate) type ErrorCallback = Box<dyn FnMut(&ConnectionRef, &DbError) + Send>;

/// What happens to an error callback handed back after firing.
pub(crate) enum Restored {
    /// Back in its slot.
    Stored,
    /// An error arrived while it ran; fire it again.
    Fire(ErrorCallback, DbError),
    /// No longer wanted; drop it outside the lock.
    Retired(ErrorCallback),
}

#[derive(Debug)]
enum Resolution {
    Pending,
    Connected,
    Failed(DbError),
}

#[derive(Debug, Clone, Copy)]
struct ReleaseRequest {
    mode: ReleaseMode,
    broken: bool,
}

/// What the runner should do next.
#[derive(Debug)]
pub(crate) enum Step {
    /// Execute this statement; it is now the pending one.
    Run(Statement),
    /// Resolve this statement with the error without executing it.
    Fail(Statement, DbError),
    /// Nothing runnable; wait for a wake-up.
    Wait,
    /// Hand the connection back and stop.
    Shutdown(ReleaseMode),
}

/// Work to carry out once the state lock is dropped.
#[must_use]
#[derive(Default)]
pub(crate) struct Effects {
    pub ready: Option<ReadyCallback>,
    pub error: Option<(ErrorCallback, DbError)>,
    pub resolved: Vec<(Statement, DbError)>,
    /// Callbacks cleared on release, dropped once the lock is gone.
    pub retired: (Option<ReadyCallback>, Option<ErrorCallback>),
}

impl Effects {
    fn resolve_all(queue: &mut VecDeque<Statement>, err: &DbError) -> Vec<(Statement, DbError)> {
        queue.drain(..).map(|s| (s, err.clone())).collect()
    }
}

pub(crate) struct QueueState {
    resolution: Resolution,
    queue: VecDeque<Statement>,
    pending: bool,
    error: Option<DbError>,
    error_handled: bool,
    in_transaction: bool,
    released: Option<ReleaseRequest>,
    shut_down: bool,
    ready_cb: Option<ReadyCallback>,
    error_cb: Option<ErrorCallback>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueState {
    pub fn new() -> Self {
        Self {
            resolution: Resolution::Pending,
            queue: VecDeque::new(),
            pending: false,
            error: None,
            error_handled: false,
            in_transaction: false,
            released: None,
            shut_down: false,
            ready_cb: None,
            error_cb: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.released.is_some() {
            ConnectionState::Released
        } else if self.error.is_some() {
            ConnectionState::Paused
        } else if matches!(self.resolution, Resolution::Pending) {
            ConnectionState::AwaitingConnection
        } else {
            ConnectionState::Ready
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_released(&self) -> bool {
        self.released.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    fn check_open(&self) -> DbResult<()> {
        match self.released {
            Some(req) => Err(DbError::released(req.broken)),
            None => Ok(()),
        }
    }

    /// Record `err` as the current error unless one is already set.
    fn raise(&mut self, err: DbError) -> Option<(ErrorCallback, DbError)> {
        if self.error.is_some() {
            return None;
        }
        self.error = Some(err.clone());
        self.error_handled = false;
        let cb = self.error_cb.take()?;
        self.error_handled = true;
        Some((cb, err))
    }

    pub fn on_connected(&mut self) -> Effects {
        self.resolution = Resolution::Connected;
        Effects {
            ready: self.ready_cb.take(),
            ..Effects::default()
        }
    }

    pub fn on_connect_failed(&mut self, err: DbError) -> Effects {
        self.resolution = Resolution::Failed(err.clone());
        Effects {
            error: self.raise(err),
            ..Effects::default()
        }
    }

    pub fn enqueue(&mut self, statement: Statement) -> DbResult<()> {
        self.check_open()?;
        self.queue.push_back(statement);
        Ok(())
    }

    pub fn begin(&mut self, statements: Vec<Statement>) -> DbResult<()> {
        self.check_open()?;
        self.in_transaction = true;
        self.queue.extend(statements);
        Ok(())
    }

    pub fn commit(&mut self, statement: Statement) -> DbResult<()> {
        self.check_open()?;
        self.in_transaction = false;
        self.queue.push_back(statement);
        Ok(())
    }

    /// Queue a rollback. While paused, everything queued so far is discarded
    /// and the error cleared before the rollback is queued.
    pub fn rollback(&mut self, statement: Statement, to_savepoint: bool) -> DbResult<Effects> {
        self.check_open()?;
        let mut effects = Effects::default();
        if self.error.take().is_some() {
            self.error_handled = false;
            effects.resolved = Effects::resolve_all(&mut self.queue, &DbError::Discarded);
        }
        if !to_savepoint {
            self.in_transaction = false;
        }
        self.queue.push_back(statement);
        Ok(effects)
    }

    pub fn resume(&mut self, reset: bool) -> DbResult<Effects> {
        self.check_open()?;
        if self.error.take().is_none() {
            return Err(DbError::usage("resume() called on a connection that is not paused"));
        }
        self.error_handled = false;
        let mut effects = Effects::default();
        if reset {
            effects.resolved = Effects::resolve_all(&mut self.queue, &DbError::Discarded);
        }
        Ok(effects)
    }

    /// Mark the connection released. Queued statements that have not started
    /// resolve with a released error; the pending one runs to completion.
    /// Returns `None` when already released.
    pub fn release(&mut self, mode: ReleaseMode) -> Option<Effects> {
        if self.released.is_some() {
            return None;
        }
        let broken = self.error.is_some() || matches!(self.resolution, Resolution::Failed(_));
        self.released = Some(ReleaseRequest { mode, broken });
        Some(Effects {
            resolved: Effects::resolve_all(&mut self.queue, &DbError::released(broken)),
            retired: (self.ready_cb.take(), self.error_cb.take()),
            ..Effects::default()
        })
    }

    pub fn next_step(&mut self) -> Step {
        if self.pending || matches!(self.resolution, Resolution::Pending) {
            return Step::Wait;
        }
        if let Some(req) = self.released {
            if self.shut_down {
                return Step::Wait;
            }
            self.shut_down = true;
            return Step::Shutdown(req.mode);
        }
        if self.error.is_some() {
            return Step::Wait;
        }
        let Some(statement) = self.queue.pop_front() else {
            return Step::Wait;
        };
        if let Resolution::Failed(err) = &self.resolution {
            return Step::Fail(statement, err.clone());
        }
        self.pending = true;
        Step::Run(statement)
    }

    pub fn on_statement_finished(&mut self, result: &DbResult<()>) -> Effects {
        self.pending = false;
        match result {
            Err(err) if self.released.is_none() => Effects {
                error: self.raise(err.clone()),
                ..Effects::default()
            },
            _ => Effects::default(),
        }
    }

    /// Store the ready callback, or hand it back to fire now if the
    /// connection already resolved.
    pub fn set_ready_callback(&mut self, cb: ReadyCallback) -> Option<ReadyCallback> {
        if matches!(self.resolution, Resolution::Connected) {
            return Some(cb);
        }
        self.ready_cb = Some(cb);
        None
    }

    /// Store the error callback. An unhandled current error is handed back
    /// with it to fire now; the caller restores the callback afterwards.
    pub fn set_error_callback(&mut self, cb: ErrorCallback) -> Option<(ErrorCallback, DbError)> {
        if self.released.is_some() {
            return None;
        }
        match &self.error {
            Some(err) if !self.error_handled => {
                self.error_handled = true;
                Some((cb, err.clone()))
            }
            _ => {
                self.error_cb = Some(cb);
                None
            }
        }
    }

    /// Take back an error callback after it fired. An error raised while it
    /// was out of its slot went unhandled and is handed back with it.
    pub fn restore_error_callback(&mut self, cb: ErrorCallback) -> Restored {
        if self.released.is_some() || self.error_cb.is_some() {
            return Restored::Retired(cb);
        }
        match &self.error {
            Some(err) if !self.error_handled => {
                self.error_handled = true;
                Restored::Fire(cb, err.clone())
            }
            _ => {
                self.error_cb = Some(cb);
                Restored::Stored
            }
        }
    }
}
