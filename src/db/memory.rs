//! Scripted in-memory capability for testing.
//!
//! Statements are matched by exact SQL text against configured responses;
//! unmatched statements succeed without rows. Every execution is recorded,
//! and the highest number of statements executing at once is tracked so
//! tests can verify serial execution.

use crate::db::capability::{Capability, DriverConnection, RowSink};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, QueryParam, Row};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// What a scripted statement produces.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Rows(Vec<Row>),
    Error(DbError),
    /// Rows followed by a failure.
    RowsThenError(Vec<Row>, DbError),
}

/// A recorded execution for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    /// Sequence number of the physical connection, starting at 1.
    pub connection: usize,
    pub sql: String,
    pub params: Vec<QueryParam>,
}

#[derive(Default)]
struct Script {
    responses: HashMap<String, ScriptedResponse>,
    recorded: Vec<RecordedStatement>,
    delay: Option<Duration>,
    connect_delay: Option<Duration>,
    connect_error: Option<DbError>,
    opened: usize,
    closed: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory [`Capability`]. Clones share the same script and records.
#[derive(Clone, Default)]
pub struct ScriptedCapability {
    script: Arc<Mutex<Script>>,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Respond to `sql` with `response`.
    pub fn with_response(self, sql: impl Into<String>, response: ScriptedResponse) -> Self {
        self.script().responses.insert(sql.into(), response);
        self
    }

    pub fn with_rows(self, sql: impl Into<String>, rows: Vec<Row>) -> Self {
        self.with_response(sql, ScriptedResponse::Rows(rows))
    }

    pub fn with_error(self, sql: impl Into<String>, err: DbError) -> Self {
        self.with_response(sql, ScriptedResponse::Error(err))
    }

    /// Sleep this long inside every execution.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script().delay = Some(delay);
        self
    }

    /// Sleep this long before every connect resolves.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.script().connect_delay = Some(delay);
        self
    }

    /// Make every connect fail with `err`.
    pub fn failing_connect(self, err: DbError) -> Self {
        self.script().connect_error = Some(err);
        self
    }

    pub fn recorded(&self) -> Vec<RecordedStatement> {
        self.script().recorded.clone()
    }

    /// Executed SQL in execution order.
    pub fn executed_sql(&self) -> Vec<String> {
        self.script()
            .recorded
            .iter()
            .map(|r| r.sql.clone())
            .collect()
    }

    /// Physical connections opened so far.
    pub fn opened(&self) -> usize {
        self.script().opened
    }

    /// Physical connections closed so far.
    pub fn closed(&self) -> usize {
        self.script().closed
    }

    /// Highest number of statements that were executing at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.script().max_in_flight
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn connect(&self, _connection_string: &str) -> DbResult<Box<dyn DriverConnection>> {
        let (delay, error) = {
            let script = self.script();
            (script.connect_delay, script.connect_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = error {
            return Err(err);
        }

        let id = {
            let mut script = self.script();
            script.opened += 1;
            script.opened
        };
        Ok(Box::new(ScriptedConnection {
            id,
            capability: self.clone(),
        }))
    }

    fn begin(&self, level: Option<IsolationLevel>) -> Vec<String> {
        match level {
            Some(level) => vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
                "BEGIN".to_string(),
            ],
            None => vec!["BEGIN".to_string()],
        }
    }
}

struct ScriptedConnection {
    id: usize,
    capability: ScriptedCapability,
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam], sink: &RowSink) -> DbResult<()> {
        let (response, delay) = {
            let mut script = self.capability.script();
            script.recorded.push(RecordedStatement {
                connection: self.id,
                sql: sql.to_string(),
                params: params.to_vec(),
            });
            script.in_flight += 1;
            script.max_in_flight = script.max_in_flight.max(script.in_flight);
            (script.responses.get(sql).cloned(), script.delay)
        };

        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let result = match response {
            None => Ok(()),
            Some(ScriptedResponse::Rows(rows)) => {
                rows.into_iter().for_each(|row| sink.row(row));
                Ok(())
            }
            Some(ScriptedResponse::Error(err)) => Err(err),
            Some(ScriptedResponse::RowsThenError(rows, err)) => {
                rows.into_iter().for_each(|row| sink.row(row));
                Err(err)
            }
        };

        self.capability.script().in_flight -= 1;
        result
    }

    async fn close(self: Box<Self>) {
        self.capability.script().closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cursor::Cursor;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_rows_and_recording() {
        let mut row = Row::new();
        row.insert("a".to_string(), json!(1));
        let cap = ScriptedCapability::new().with_rows("SELECT a", vec![row.clone()]);

        let mut conn = cap.connect("memory://").await.unwrap();
        let (cursor, sink) = Cursor::channel();
        let rows = cursor.all().unwrap();
        cap.execute(conn.as_mut(), "SELECT a", &[QueryParam::Int(1)], &sink)
            .await
            .unwrap();
        sink.finish(Ok(()));

        assert_eq!(rows.await.unwrap(), vec![row]);
        assert_eq!(cap.executed_sql(), vec!["SELECT a"]);
        assert_eq!(cap.recorded()[0].params, vec![QueryParam::Int(1)]);
        assert_eq!(cap.opened(), 1);

        cap.close(conn).await;
        assert_eq!(cap.closed(), 1);
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let cap = ScriptedCapability::new().failing_connect(DbError::connection("refused", "none"));
        assert!(cap.connect("memory://").await.is_err());
        assert_eq!(cap.opened(), 0);
    }
}
