//! Data models for the MySQL adapter.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionString, ConnectionStringError};
pub use query::{CommandTimeout, QueryContext, QueryOptions, Row, ScalarResult, Table};
