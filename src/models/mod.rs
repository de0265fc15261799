//! Data models for anysql.
//!
//! This module re-exports all model types used throughout the library.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::DatabaseType;
pub use query::{IsolationLevel, QueryParam, Row};
