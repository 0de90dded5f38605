//! Collaborator traits between the execution core and a database driver.
//!
//! The core never talks to sqlx directly. It asks a [`Connector`] for a fresh
//! [`Connection`] on every attempt and runs exactly one command on it. The
//! production implementation lives in [`crate::db::mysql`].

use crate::db::failure::DriverError;
use crate::models::{CommandTimeout, ConnectionString, Row, Table};
use async_trait::async_trait;

/// Produces a new, open connection for every attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to the database named by `connection_string`.
    async fn open(
        &self,
        connection_string: &ConnectionString,
    ) -> Result<Box<dyn Connection>, DriverError>;
}

/// A single open connection. Never shared between calls.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement (or several `;`-separated statements) and return the
    /// total number of affected rows.
    async fn execute(&mut self, sql: &str, timeout: CommandTimeout) -> Result<u64, DriverError>;

    /// Run a query and collect every row.
    async fn query(&mut self, sql: &str, timeout: CommandTimeout) -> Result<Table, DriverError>;

    /// Run a multi-statement batch and collect one [`Table`] per statement,
    /// in statement order.
    async fn query_sets(
        &mut self,
        sql: &str,
        timeout: CommandTimeout,
    ) -> Result<Vec<Table>, DriverError>;

    /// Run a query and hand each row to `on_row` as it arrives.
    /// Returns the number of rows visited.
    async fn query_each(
        &mut self,
        sql: &str,
        timeout: CommandTimeout,
        on_row: &mut (dyn FnMut(Row) + Send),
    ) -> Result<u64, DriverError>;

    /// Close the connection gracefully.
    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}
