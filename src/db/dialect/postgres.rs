//! PostgreSQL adapter.

use super::connect_error;
use crate::db::capability::{Capability, DriverConnection, RowSink};
use crate::db::params::BindParams;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel, QueryParam};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Executor, Postgres};
use tracing::{debug, warn};

/// Rewrite `?` placeholders to `$1`, `$2`, ... in order of appearance.
///
/// `?` inside single-quoted literals is left alone. Escaped quotes inside
/// literals are not recognized.
pub fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut in_literal = false;
    let mut index = 0;

    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                out.push(ch);
            }
            '?' if !in_literal => {
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Capability for `postgres://` and `postgresql://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresCapability;

#[async_trait]
impl Capability for PostgresCapability {
    async fn connect(&self, connection_string: &str) -> DbResult<Box<dyn DriverConnection>> {
        let conn = PgConnection::connect(connection_string)
            .await
            .map_err(|e| connect_error(DatabaseType::PostgreSQL, &e))?;
        debug!("Opened PostgreSQL connection");
        Ok(Box::new(PgDriverConnection { conn }))
    }

    fn begin(&self, level: Option<IsolationLevel>) -> Vec<String> {
        match level {
            Some(level) => vec![format!(
                "START TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            )],
            None => vec!["BEGIN".to_string()],
        }
    }

    fn error_message(&self, err: &DbError) -> String {
        match err.root_cause() {
            DbError::Database {
                message,
                sql_state: Some(code),
                ..
            } => format!("{} (SQLSTATE {})", message, code),
            _ => err.to_string(),
        }
    }
}

struct PgDriverConnection {
    conn: PgConnection,
}

#[async_trait]
impl DriverConnection for PgDriverConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam], sink: &RowSink) -> DbResult<()> {
        if params.is_empty() {
            let mut rows = (&mut self.conn).fetch(sql);
            while let Some(row) = rows.try_next().await? {
                sink.row(row.to_json_map());
            }
        } else {
            let sql = rewrite_placeholders(sql);
            let query = sqlx::query::<Postgres>(&sql).bind_params(params);
            let mut rows = query.fetch(&mut self.conn);
            while let Some(row) = rows.try_next().await? {
                sink.row(row.to_json_map());
            }
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            warn!(error = %e, "Failed to close PostgreSQL connection cleanly");
        }
    }
}
