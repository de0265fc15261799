//! Database abstraction layer.
//!
//! This module provides the connection core and its collaborators:
//! - Driver capability traits implemented per database family
//! - Connection promises with a serialized statement queue
//! - Result cursors
//! - A bounded connection pool
//! - The process-wide driver registry
//! - sqlx-backed SQLite, PostgreSQL and MySQL adapters

pub mod capability;
pub mod connection;
pub mod cursor;
pub mod dialect;
pub mod memory;
pub mod params;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod types;

pub use capability::{Capability, DriverConnection, RowSink};
pub use connection::{ConnectionAction, ConnectionFuture, ConnectionPromise, ConnectionRef};
pub use cursor::Cursor;
pub use dialect::{MySqlCapability, PostgresCapability, SqliteCapability, rewrite_placeholders};
pub use memory::ScriptedCapability;
pub use pool::{ConnectionPool, PoolStatus};
pub use queue::{ConnectionState, Statement};
pub use registry::{
    Driver, DriverRegistration, connect, driver_for_url, get_driver, pool, register,
    register_builtin_drivers,
};
