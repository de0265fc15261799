//! anysql Library
//!
//! A uniform, queue-serialized connection interface over SQLite, PostgreSQL
//! and MySQL. A [`ConnectionPromise`] accepts statements immediately, runs
//! them one at a time in submission order once the physical connection is
//! available, pauses on errors until resumed, and hands results back through
//! lazily consumed [`Cursor`]s.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, DatabaseConfig, PoolOptions};
pub use db::{
    Capability, ConnectionPool, ConnectionPromise, ConnectionRef, ConnectionState, Cursor, Driver,
    DriverConnection, RowSink, register_builtin_drivers,
};
pub use error::{DbError, DbResult};
pub use models::{IsolationLevel, QueryParam, Row};
