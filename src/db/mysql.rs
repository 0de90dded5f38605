//! sqlx-backed MySQL connector.
//!
//! Opens one `MySqlConnection` per attempt (no pooling) and enforces command
//! timeouts with `tokio::time::timeout` around the driver future.

use crate::db::connection::{Connection, Connector};
use crate::db::failure::DriverError;
use crate::db::types::{row_to_map, rows_to_table};
use crate::models::{
    CommandTimeout, ConnectionString, ConnectionStringError, Row, Table,
};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{Column, ConnectOptions, Connection as _, Either, Executor};
use std::future::Future;
use std::str::FromStr;
use tokio::time::timeout;
use tracing::debug;

/// Default [`Connector`] talking to a real MySQL server.
#[derive(Debug, Clone, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn open(
        &self,
        connection_string: &ConnectionString,
    ) -> Result<Box<dyn Connection>, DriverError> {
        let options = connect_options(connection_string)
            .map_err(|e| DriverError::connection(e.to_string()))?;
        let conn = options.connect().await.map_err(DriverError::from)?;
        debug!(target_db = %connection_string, "Opened MySQL connection");
        Ok(Box::new(MySqlSession { conn }))
    }
}

/// Translate a connection string into sqlx connect options.
///
/// Recognized keys in the key/value form (case and inner whitespace ignored):
/// `server`/`host`/`datasource`, `port`, `userid`/`uid`/`user`/`username`,
/// `password`/`pwd`, `database`/`initialcatalog`, `characterset`/`charset`,
/// `sslmode`.
pub fn connect_options(
    connection_string: &ConnectionString,
) -> Result<MySqlConnectOptions, ConnectionStringError> {
    if connection_string.is_url() {
        return MySqlConnectOptions::from_str(connection_string.as_str())
            .map_err(|e| ConnectionStringError::InvalidUrl(e.to_string()));
    }

    let mut options = MySqlConnectOptions::new();
    for (key, value) in connection_string.pairs()? {
        options = match key.as_str() {
            "server" | "host" | "datasource" | "address" => options.host(&value),
            "port" => {
                let port = value
                    .parse::<u16>()
                    .map_err(|_| ConnectionStringError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                    })?;
                options.port(port)
            }
            "userid" | "uid" | "user" | "username" => options.username(&value),
            "password" | "pwd" => options.password(&value),
            "database" | "initialcatalog" => options.database(&value),
            "characterset" | "charset" => options.charset(&value),
            "sslmode" => {
                let mode = MySqlSslMode::from_str(&value).map_err(|_| {
                    ConnectionStringError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                    }
                })?;
                options.ssl_mode(mode)
            }
            _ => return Err(ConnectionStringError::UnsupportedKey(key)),
        };
    }
    Ok(options)
}

/// One open MySQL connection.
struct MySqlSession {
    conn: MySqlConnection,
}

impl MySqlSession {
    /// Column names of `sql`'s result from the prepared statement metadata.
    ///
    /// Empty when the statement cannot be described, e.g. a multi-statement
    /// batch.
    async fn describe_columns(&mut self, sql: &str, limit: CommandTimeout) -> Vec<String> {
        match with_timeout(limit, (&mut self.conn).describe(sql)).await {
            Ok(described) => described
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            Err(e) => {
                debug!(error = %e, "Could not describe empty result");
                Vec::new()
            }
        }
    }
}

/// Run `fut` under the command timeout.
async fn with_timeout<T, F>(limit: CommandTimeout, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match limit.as_duration() {
        Some(duration) => match timeout(duration, fut).await {
            Ok(result) => result.map_err(DriverError::from),
            Err(_) => Err(DriverError::Timeout { elapsed: duration }),
        },
        None => fut.await.map_err(DriverError::from),
    }
}

#[async_trait]
impl Connection for MySqlSession {
    async fn execute(&mut self, sql: &str, limit: CommandTimeout) -> Result<u64, DriverError> {
        // Raw SQL (no arguments) goes over the text protocol, which allows
        // several `;`-separated statements in one round trip.
        let result = with_timeout(limit, (&mut self.conn).execute(sql)).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, limit: CommandTimeout) -> Result<Table, DriverError> {
        let rows = with_timeout(limit, (&mut self.conn).fetch_all(sql)).await?;
        let mut table = rows_to_table(&rows);
        if table.columns.is_empty() {
            // No row to read names from; ask the server for the result shape
            table.columns = self.describe_columns(sql, limit).await;
        }
        Ok(table)
    }

    async fn query_sets(
        &mut self,
        sql: &str,
        limit: CommandTimeout,
    ) -> Result<Vec<Table>, DriverError> {
        let conn = &mut self.conn;
        let collect = async move {
            let mut stream = conn.fetch_many(sql);
            let mut sets = Vec::new();
            let mut rows = Vec::new();
            while let Some(step) = stream.try_next().await? {
                match step {
                    // End of one statement's result
                    Either::Left(_) => sets.push(rows_to_table(&std::mem::take(&mut rows))),
                    Either::Right(row) => rows.push(row),
                }
            }
            if !rows.is_empty() {
                sets.push(rows_to_table(&rows));
            }
            Ok::<Vec<Table>, sqlx::Error>(sets)
        };
        with_timeout(limit, collect).await
    }

    async fn query_each(
        &mut self,
        sql: &str,
        limit: CommandTimeout,
        on_row: &mut (dyn FnMut(Row) + Send),
    ) -> Result<u64, DriverError> {
        let conn = &mut self.conn;
        let visit = async move {
            let mut stream = conn.fetch(sql);
            let mut count = 0u64;
            while let Some(row) = stream.try_next().await? {
                on_row(row_to_map(&row));
                count += 1;
            }
            Ok::<u64, sqlx::Error>(count)
        };
        with_timeout(limit, visit).await
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.conn.close().await.map_err(DriverError::from)
    }
}
