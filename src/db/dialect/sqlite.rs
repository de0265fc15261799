//! SQLite adapter.

use super::connect_error;
use crate::db::capability::{Capability, DriverConnection, RowSink};
use crate::db::params::BindParams;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel, QueryParam};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Executor, Sqlite};
use std::str::FromStr;
use tracing::{debug, warn};

/// Capability for `sqlite:` URLs. Database files are created on demand.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteCapability;

#[async_trait]
impl Capability for SqliteCapability {
    async fn connect(&self, connection_string: &str) -> DbResult<Box<dyn DriverConnection>> {
        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the connection URL format: sqlite:path/to/db.sqlite",
                )
            })?
            .create_if_missing(true);

        let conn = options
            .connect()
            .await
            .map_err(|e| connect_error(DatabaseType::SQLite, &e))?;
        debug!("Opened SQLite connection");
        Ok(Box::new(SqliteDriverConnection { conn }))
    }

    fn begin(&self, level: Option<IsolationLevel>) -> Vec<String> {
        match level {
            Some(IsolationLevel::ReadUncommitted) => vec![
                "PRAGMA read_uncommitted = 1".to_string(),
                "BEGIN".to_string(),
            ],
            Some(IsolationLevel::Serializable) => vec!["BEGIN IMMEDIATE".to_string()],
            _ => vec!["BEGIN".to_string()],
        }
    }
}

struct SqliteDriverConnection {
    conn: SqliteConnection,
}

#[async_trait]
impl DriverConnection for SqliteDriverConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam], sink: &RowSink) -> DbResult<()> {
        if params.is_empty() {
            let mut rows = (&mut self.conn).fetch(sql);
            while let Some(row) = rows.try_next().await? {
                sink.row(row.to_json_map());
            }
        } else {
            let query = sqlx::query::<Sqlite>(sql).bind_params(params);
            let mut rows = query.fetch(&mut self.conn);
            while let Some(row) = rows.try_next().await? {
                sink.row(row.to_json_map());
            }
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            warn!(error = %e, "Failed to close SQLite connection cleanly");
        }
    }
}
