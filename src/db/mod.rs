//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Collaborator traits between the execution core and the driver
//! - Failure classification and per-code error handlers
//! - The retrying execution core
//! - The sqlx MySQL connector and type mappings

pub mod connection;
pub mod executor;
pub mod failure;
pub mod handlers;
pub mod mysql;
pub mod types;

pub use connection::{Connection, Connector};
pub use executor::{AdapterBuilder, ErrorObserver, MySqlAdapter, Operation};
pub use failure::{DriverError, ErrorCode};
pub use handlers::{ErrorHandler, ErrorHandlers};
pub use mysql::MySqlConnector;
