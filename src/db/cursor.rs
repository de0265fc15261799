//! Per-statement result cursors.
//!
//! A [`Cursor`] is handed out for every scheduled statement. The runner feeds
//! it through a [`RowSink`]; the caller picks exactly one way to consume the
//! rows (`all`, `each`, `first` or `scalar`) and may additionally await
//! `then` for the statement's outcome.

use crate::error::{DbError, DbResult};
use crate::models::Row;
use futures_util::stream::{self, Stream};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    Each,
    First,
}

impl Mode {
    fn name(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Each => "each",
            Self::First => "first/scalar",
        }
    }
}

/// Notification produced while a statement runs. Every event for one
/// statement is handled by [`CursorInner::dispatch`] and nothing else.
#[derive(Debug)]
pub(crate) enum StatementEvent {
    Row(Row),
    End,
    Error(DbError),
}

#[derive(Default)]
struct CursorState {
    rows: VecDeque<Row>,
    row_count: usize,
    outcome: Option<DbResult<()>>,
    mode: Option<Mode>,
    then_attached: bool,
}

struct CursorInner {
    state: Mutex<CursorState>,
    changed: Notify,
}

impl CursorInner {
    fn lock(&self) -> MutexGuard<'_, CursorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, event: StatementEvent) {
        {
            let mut state = self.lock();
            // Nothing is accepted once the statement resolved
            if state.outcome.is_some() {
                return;
            }
            match event {
                StatementEvent::Row(row) => {
                    state.row_count += 1;
                    if state.mode != Some(Mode::First) || state.row_count == 1 {
                        state.rows.push_back(row);
                    }
                }
                StatementEvent::End => state.outcome = Some(Ok(())),
                StatementEvent::Error(err) => {
                    if state.mode == Some(Mode::Each) {
                        state.rows.clear();
                    } else {
                        state.rows.truncate(1);
                    }
                    state.outcome = Some(Err(err));
                }
            }
        }
        self.changed.notify_waiters();
    }

    async fn wait_until(&self, ready: impl Fn(&CursorState) -> bool) {
        loop {
            let notified = self.changed.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            let done = ready(&self.lock());
            if done {
                return;
            }
            notified.await;
        }
    }
}

/// Lazy, single-use view over one statement's rows.
#[derive(Clone)]
pub struct Cursor {
    inner: Arc<CursorInner>,
}

impl Cursor {
    /// Create a cursor together with the sink the runner feeds.
    pub(crate) fn channel() -> (Cursor, RowSink) {
        let inner = Arc::new(CursorInner {
            state: Mutex::new(CursorState::default()),
            changed: Notify::new(),
        });
        (
            Cursor {
                inner: inner.clone(),
            },
            RowSink { inner },
        )
    }

    fn attach(&self, mode: Mode) -> DbResult<()> {
        let mut state = self.inner.lock();
        if let Some(existing) = state.mode {
            return Err(DbError::usage(format!(
                "Cannot attach {} to a cursor already consumed by {}",
                mode.name(),
                existing.name()
            )));
        }
        state.mode = Some(mode);
        match mode {
            Mode::First => state.rows.truncate(1),
            Mode::Each if matches!(state.outcome, Some(Err(_))) => state.rows.clear(),
            _ => {}
        }
        Ok(())
    }

    /// Collect every row, resolving after the statement ends.
    pub fn all(&self) -> DbResult<impl Future<Output = DbResult<Vec<Row>>> + Send + 'static> {
        self.attach(Mode::All)?;
        let inner = self.inner.clone();
        Ok(async move {
            inner.wait_until(|s| s.outcome.is_some()).await;
            let mut state = inner.lock();
            match state.outcome.clone() {
                Some(Err(err)) => Err(err),
                _ => Ok(state.rows.drain(..).collect()),
            }
        })
    }

    /// Stream rows as they arrive. After an error the stream yields that
    /// error once and ends; rows still buffered at that point are dropped.
    pub fn each(&self) -> DbResult<impl Stream<Item = DbResult<Row>> + Send + 'static> {
        self.attach(Mode::Each)?;
        let inner = self.inner.clone();
        Ok(stream::unfold(Some(inner), |inner| async move {
            let inner = inner?;
            inner
                .wait_until(|s| !s.rows.is_empty() || s.outcome.is_some())
                .await;
            let next = {
                let mut state = inner.lock();
                match state.rows.pop_front() {
                    Some(row) => Some(Ok(row)),
                    None => match &state.outcome {
                        Some(Err(err)) => Some(Err(err.clone())),
                        _ => None,
                    },
                }
            };
            match next {
                Some(Ok(row)) => Some((Ok(row), Some(inner))),
                Some(Err(err)) => Some((Err(err), None)),
                None => None,
            }
        }))
    }

    /// The first row, resolving as soon as it arrives. Later rows are
    /// discarded. A statement that ends without rows yields `None`, also when
    /// it failed; the failure is still reported through `then` and the
    /// connection's error callback.
    pub fn first(&self) -> DbResult<impl Future<Output = Option<Row>> + Send + 'static> {
        self.attach(Mode::First)?;
        let inner = self.inner.clone();
        Ok(async move {
            inner
                .wait_until(|s| !s.rows.is_empty() || s.outcome.is_some())
                .await;
            inner.lock().rows.pop_front()
        })
    }

    /// The first column of the first row.
    pub fn scalar(&self) -> DbResult<impl Future<Output = Option<JsonValue>> + Send + 'static> {
        let first = self.first()?;
        Ok(async move {
            first
                .await
                .and_then(|row| row.into_iter().next().map(|(_, value)| value))
        })
    }

    /// Resolve once the statement has finished, with its error if it failed.
    pub fn then(&self) -> DbResult<impl Future<Output = DbResult<()>> + Send + 'static> {
        {
            let mut state = self.inner.lock();
            if state.then_attached {
                return Err(DbError::usage("then() already attached to this cursor"));
            }
            state.then_attached = true;
        }
        let inner = self.inner.clone();
        Ok(async move {
            inner.wait_until(|s| s.outcome.is_some()).await;
            inner.lock().outcome.clone().unwrap_or(Ok(()))
        })
    }

    /// Whether the statement has resolved.
    pub fn is_done(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    /// Rows produced so far, including discarded ones.
    pub fn row_count(&self) -> usize {
        self.inner.lock().row_count
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Cursor")
            .field("mode", &state.mode)
            .field("row_count", &state.row_count)
            .field("done", &state.outcome.is_some())
            .finish()
    }
}

/// Write side of a cursor, handed to drivers while a statement executes.
pub struct RowSink {
    inner: Arc<CursorInner>,
}

impl RowSink {
    /// Deliver one result row.
    pub fn row(&self, row: Row) {
        self.inner.dispatch(StatementEvent::Row(row));
    }

    /// Rows delivered so far.
    pub(crate) fn row_count(&self) -> usize {
        self.inner.lock().row_count
    }

    /// Resolve the statement. Later calls and rows are ignored.
    pub(crate) fn finish(&self, result: DbResult<()>) {
        let event = match result {
            Ok(()) => StatementEvent::End,
            Err(err) => StatementEvent::Error(err),
        };
        self.inner.dispatch(event);
    }
}

impl Drop for RowSink {
    fn drop(&mut self) {
        // A statement must never leave its cursor pending
        self.inner.dispatch(StatementEvent::Error(DbError::internal(
            "Statement dropped before it completed",
        )));
    }
}

impl fmt::Debug for RowSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowSink").finish_non_exhaustive()
    }
}
