//! The contract a database adapter implements.
//!
//! A [`Capability`] opens physical connections and renders transaction SQL
//! for its dialect. The [`DriverConnection`] it returns executes statements,
//! streaming rows into a [`RowSink`].

use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, QueryParam};
use async_trait::async_trait;

pub use crate::db::cursor::RowSink;

/// A live session with a database, owned by one connection at a time.
#[async_trait]
pub trait DriverConnection: Send {
    /// Run one statement, sending each result row to `sink`.
    ///
    /// Returning `Ok(())` signals the end of the row stream; an `Err` is the
    /// statement's failure.
    async fn execute(&mut self, sql: &str, params: &[QueryParam], sink: &RowSink) -> DbResult<()>;

    /// Tear the session down.
    async fn close(self: Box<Self>);
}

/// Operations a database family provides to the connection core.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Open a new physical connection.
    async fn connect(&self, connection_string: &str) -> DbResult<Box<dyn DriverConnection>>;

    /// Tear down a physical connection.
    async fn close(&self, conn: Box<dyn DriverConnection>) {
        conn.close().await;
    }

    /// Execute one statement on `conn`.
    async fn execute(
        &self,
        conn: &mut dyn DriverConnection,
        sql: &str,
        params: &[QueryParam],
        sink: &RowSink,
    ) -> DbResult<()> {
        conn.execute(sql, params, sink).await
    }

    /// Statements that open a transaction, in execution order.
    fn begin(&self, level: Option<IsolationLevel>) -> Vec<String>;

    /// Statement creating savepoint `name`.
    fn save(&self, name: &str) -> String {
        format!("SAVEPOINT {name}")
    }

    fn commit(&self) -> String {
        "COMMIT".to_string()
    }

    /// Statement rolling back the transaction, or to savepoint `name`.
    fn rollback(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("ROLLBACK TO SAVEPOINT {name}"),
            None => "ROLLBACK".to_string(),
        }
    }

    /// Render a driver error for people.
    fn error_message(&self, err: &DbError) -> String {
        err.to_string()
    }
}
