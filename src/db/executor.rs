//! Retrying execution core.
//!
//! [`MySqlAdapter`] runs one unit of work per call on a freshly opened
//! connection and routes every failure through the [`ErrorHandlers`]
//! registry:
//!
//! - handled code: run the handler, notify `on_error_processed`, sleep the
//!   retry interval and try again (when retry is enabled)
//! - unhandled code: notify `on_error` and give up without retrying
//!
//! The plain methods (`execute`, `select`, ...) swallow failures and return an
//! empty value; the observers are the error channel. Every method has a
//! `try_` twin that returns the same failure as an [`AdapterError`].
//!
//! # Architecture
//!
//! The shape of the work is an [`Operation`]. The built-in shapes cover
//! affected-row counts, tables, per-statement table sets, single rows, scalars
//! and streamed rows; the retry loop in [`MySqlAdapter::try_run`] is shared by all of them.

use crate::config::{AdapterOptions, ConnectionFile};
use crate::db::connection::{Connection, Connector};
use crate::db::failure::{DriverError, ErrorCode};
use crate::db::handlers::{ErrorHandler, ErrorHandlers};
use crate::db::mysql::{MySqlConnector, connect_options};
use crate::db::types::convert_scalar;
use crate::error::{AdapterError, AdapterResult};
use crate::models::{
    CommandTimeout, ConnectionString, QueryContext, QueryOptions, Row, ScalarResult, Table,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Observer invoked with the failing error and the call's context.
pub type ErrorObserver = Arc<dyn Fn(&DriverError, &QueryContext) + Send + Sync>;

// =============================================================================
// Operations
// =============================================================================

/// One shape of work performed on an open connection.
///
/// `perform` may run several times for one call (once per attempt), always
/// on a new connection.
#[async_trait]
pub trait Operation: Send {
    type Output: Send;

    /// Label used in logs.
    const NAME: &'static str;

    async fn perform(
        &mut self,
        conn: &mut dyn Connection,
        ctx: &QueryContext,
    ) -> Result<Self::Output, DriverError>;
}

/// Affected-row count of a statement batch.
#[derive(Debug, Default)]
pub struct Execute;

#[async_trait]
impl Operation for Execute {
    type Output = u64;
    const NAME: &'static str = "execute";

    async fn perform(
        &mut self,
        conn: &mut dyn Connection,
        ctx: &QueryContext,
    ) -> Result<u64, DriverError> {
        conn.execute(&ctx.query, ctx.command_timeout).await
    }
}

/// Full result set.
#[derive(Debug, Default)]
pub struct Select;

#[async_trait]
impl Operation for Select {
    type Output = Table;
    const NAME: &'static str = "select";

    async fn perform(
        &mut self,
        conn: &mut dyn Connection,
        ctx: &QueryContext,
    ) -> Result<Table, DriverError> {
        conn.query(&ctx.query, ctx.command_timeout).await
    }
}

/// One table per statement of a multi-statement batch.
#[derive(Debug, Default)]
pub struct SelectDataSet;

#[async_trait]
impl Operation for SelectDataSet {
    type Output = Vec<Table>;
    const NAME: &'static str = "select_data_set";

    async fn perform(
        &mut self,
        conn: &mut dyn Connection,
        ctx: &QueryContext,
    ) -> Result<Vec<Table>, DriverError> {
        conn.query_sets(&ctx.query, ctx.command_timeout).await
    }
}

/// First row of the result set.
#[derive(Debug, Default)]
pub struct SelectRow;

#[async_trait]
impl Operation for SelectRow {
    type Output = Option<Row>;
    const NAME: &'static str = "select_row";

    async fn perform(
        &mut self,
        conn: &mut dyn Connection,
        ctx: &QueryContext,
    ) -> Result<Option<Row>, DriverError> {
        let table = conn.query(&ctx.query, ctx.command_timeout).await?;
        Ok(table.rows.into_iter().next())
    }
}

/// First column of the first row, converted to `T`.
pub struct SelectScalar<T>(PhantomData<fn() -> T>);

impl<T> Default for SelectScalar<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> Operation for SelectScalar<T> {
    type Output = ScalarResult<T>;
    const NAME: &'static str = "select_scalar";

    async fn perform(
        &mut self,
        conn: &mut dyn Connection,
        ctx: &QueryContext,
    ) -> Result<ScalarResult<T>, DriverError> {
        let table = conn.query(&ctx.query, ctx.command_timeout).await?;
        match table.first_value() {
            Some(value) => convert_scalar(value)
                .map(ScalarResult::new)
                .map_err(DriverError::decode),
            None => Ok(ScalarResult::db_null()),
        }
    }
}

/// Streams every row into a callback; yields the number of rows visited.
///
/// On retry the callback sees the rows of the new attempt again.
pub struct SelectReader<F> {
    on_row: F,
}

impl<F> SelectReader<F>
where
    F: FnMut(Row) + Send,
{
    pub fn new(on_row: F) -> Self {
        Self { on_row }
    }
}

#[async_trait]
impl<F> Operation for SelectReader<F>
where
    F: FnMut(Row) + Send,
{
    type Output = u64;
    const NAME: &'static str = "select_reader";

    async fn perform(
        &mut self,
        conn: &mut dyn Connection,
        ctx: &QueryContext,
    ) -> Result<u64, DriverError> {
        conn.query_each(&ctx.query, ctx.command_timeout, &mut self.on_row)
            .await
    }
}

// =============================================================================
// Adapter
// =============================================================================

struct AdapterInner {
    connection_string: ConnectionString,
    connector: Arc<dyn Connector>,
    options: AdapterOptions,
    handlers: RwLock<ErrorHandlers>,
    on_error: Option<ErrorObserver>,
    on_error_processed: Option<ErrorObserver>,
    running: AtomicUsize,
    shutdown: CancellationToken,
}

/// Retrying MySQL execution core.
///
/// Cheap to clone; clones share the connection string, handlers, observers,
/// the in-flight counter and the shutdown signal.
#[derive(Clone)]
pub struct MySqlAdapter {
    inner: Arc<AdapterInner>,
}

/// Keeps the in-flight counter accurate even when a call is dropped mid-way.
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MySqlAdapter {
    /// Create an adapter with default options and handlers.
    pub fn new(connection_string: impl Into<String>) -> AdapterResult<Self> {
        Self::builder(connection_string).build()
    }

    /// Create an adapter from a named entry of a connection file.
    pub fn from_file(name: &str, path: impl AsRef<Path>) -> AdapterResult<Self> {
        AdapterBuilder::from_file(name, path)?.build()
    }

    pub fn builder(connection_string: impl Into<String>) -> AdapterBuilder {
        AdapterBuilder::new(connection_string)
    }

    pub fn connection_string(&self) -> &ConnectionString {
        &self.inner.connection_string
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.inner.options
    }

    /// Number of calls currently inside the retry loop.
    pub fn running_queries(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register (or replace) a handler at runtime.
    pub fn register_handler(&self, code: ErrorCode, handler: ErrorHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(code, handler);
    }

    /// Remove a handler at runtime; the code becomes fatal.
    pub fn remove_handler(&self, code: ErrorCode) -> Option<ErrorHandler> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(code)
    }

    pub fn handled_codes(&self) -> Vec<ErrorCode> {
        self.handlers_snapshot(|h| h.codes())
    }

    /// Abandon pending retry sleeps. Later calls fail with `Cancelled`.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn handlers_snapshot<R>(&self, f: impl FnOnce(&ErrorHandlers) -> R) -> R {
        f(&self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner))
    }

    fn context(&self, sql: &str, options: QueryOptions) -> QueryContext {
        QueryContext::new(
            sql,
            options.timeout.unwrap_or(self.inner.options.command_timeout),
            options.retry.unwrap_or(self.inner.options.retry_on_error),
        )
    }

    fn notify_error(&self, err: &DriverError, ctx: &QueryContext) {
        if let Some(observer) = &self.inner.on_error {
            observer(err, ctx);
        }
    }

    fn notify_processed(&self, err: &DriverError, ctx: &QueryContext) {
        if let Some(observer) = &self.inner.on_error_processed {
            observer(err, ctx);
        }
    }

    /// Run `op` for `sql` under the retry policy.
    pub async fn try_run<O: Operation>(
        &self,
        sql: &str,
        mut op: O,
        options: QueryOptions,
    ) -> AdapterResult<O::Output> {
        let _running = RunningGuard::enter(&self.inner.running);
        let mut ctx = self.context(sql, options);
        let start = Instant::now();

        loop {
            if self.is_closed() {
                return Err(AdapterError::Cancelled);
            }
            ctx.attempt += 1;
            debug!(
                operation = O::NAME,
                attempt = ctx.attempt,
                timeout = %ctx.command_timeout,
                "Running query"
            );

            let err = match self.attempt(&mut op, &ctx).await {
                Ok(output) => {
                    debug!(
                        operation = O::NAME,
                        attempts = ctx.attempt,
                        execution_time_ms = start.elapsed().as_millis() as u64,
                        "Query completed"
                    );
                    return Ok(output);
                }
                Err(err) => err,
            };

            let code = err.code();
            let Some(handler) = self.handlers_snapshot(|h| h.get(code).cloned()) else {
                error!(
                    operation = O::NAME,
                    code = %code,
                    error = %err,
                    sql = %ctx.query,
                    "Unhandled query error"
                );
                self.notify_error(&err, &ctx);
                return Err(err.into());
            };

            handler.apply(&err, &mut ctx);
            warn!(
                operation = O::NAME,
                code = %code,
                attempt = ctx.attempt,
                retry = ctx.retry,
                error = %err,
                "Handled query error"
            );
            self.notify_processed(&err, &ctx);

            if !ctx.retry {
                return Err(err.into());
            }
            if let Some(max) = self.inner.options.max_attempts {
                if ctx.attempt >= max {
                    error!(
                        operation = O::NAME,
                        attempts = ctx.attempt,
                        error = %err,
                        "Giving up after maximum attempts"
                    );
                    self.notify_error(&err, &ctx);
                    return Err(AdapterError::retries_exhausted(ctx.attempt, &err));
                }
            }

            self.pause(self.inner.options.retry_interval).await?;
        }
    }

    /// Run `op` and swallow the failure (observers already saw it).
    pub async fn run<O>(&self, sql: &str, op: O, options: QueryOptions) -> O::Output
    where
        O: Operation,
        O::Output: Default,
    {
        self.try_run(sql, op, options).await.unwrap_or_default()
    }

    async fn attempt<O: Operation>(
        &self,
        op: &mut O,
        ctx: &QueryContext,
    ) -> Result<O::Output, DriverError> {
        let mut conn = self
            .inner
            .connector
            .open(&self.inner.connection_string)
            .await?;
        let result = op.perform(conn.as_mut(), ctx).await;
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Connection did not close cleanly");
        }
        result
    }

    async fn pause(&self, interval: Duration) -> AdapterResult<()> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(AdapterError::Cancelled),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // execute
    // -------------------------------------------------------------------------

    /// Run a statement batch; 0 on failure.
    pub async fn execute(&self, sql: &str) -> u64 {
        self.execute_with(sql, QueryOptions::default()).await
    }

    pub async fn execute_with(&self, sql: &str, options: QueryOptions) -> u64 {
        self.run(sql, Execute, options).await
    }

    pub async fn try_execute(&self, sql: &str) -> AdapterResult<u64> {
        self.try_execute_with(sql, QueryOptions::default()).await
    }

    pub async fn try_execute_with(&self, sql: &str, options: QueryOptions) -> AdapterResult<u64> {
        self.try_run(sql, Execute, options).await
    }

    // -------------------------------------------------------------------------
    // select
    // -------------------------------------------------------------------------

    /// Run a query; `None` on failure.
    ///
    /// Rows of every statement in a multi-statement batch land in one table;
    /// use [`select_data_set`](Self::select_data_set) to keep them apart.
    pub async fn select(&self, sql: &str) -> Option<Table> {
        self.select_with(sql, QueryOptions::default()).await
    }

    pub async fn select_with(&self, sql: &str, options: QueryOptions) -> Option<Table> {
        self.try_select_with(sql, options).await.ok()
    }

    pub async fn try_select(&self, sql: &str) -> AdapterResult<Table> {
        self.try_select_with(sql, QueryOptions::default()).await
    }

    pub async fn try_select_with(&self, sql: &str, options: QueryOptions) -> AdapterResult<Table> {
        self.try_run(sql, Select, options).await
    }

    // -------------------------------------------------------------------------
    // select_data_set
    // -------------------------------------------------------------------------

    /// Run a statement batch and keep each statement's result as its own
    /// table; `None` on failure.
    ///
    /// A statement without a result set (or with no rows) yields an empty
    /// table with no column names.
    pub async fn select_data_set(&self, sql: &str) -> Option<Vec<Table>> {
        self.select_data_set_with(sql, QueryOptions::default()).await
    }

    pub async fn select_data_set_with(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Option<Vec<Table>> {
        self.try_select_data_set_with(sql, options).await.ok()
    }

    pub async fn try_select_data_set(&self, sql: &str) -> AdapterResult<Vec<Table>> {
        self.try_select_data_set_with(sql, QueryOptions::default())
            .await
    }

    pub async fn try_select_data_set_with(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> AdapterResult<Vec<Table>> {
        self.try_run(sql, SelectDataSet, options).await
    }

    // -------------------------------------------------------------------------
    // select_row
    // -------------------------------------------------------------------------

    /// First row; `None` on failure or when the result is empty.
    pub async fn select_row(&self, sql: &str) -> Option<Row> {
        self.select_row_with(sql, QueryOptions::default()).await
    }

    pub async fn select_row_with(&self, sql: &str, options: QueryOptions) -> Option<Row> {
        self.try_select_row_with(sql, options).await.ok().flatten()
    }

    pub async fn try_select_row(&self, sql: &str) -> AdapterResult<Option<Row>> {
        self.try_select_row_with(sql, QueryOptions::default()).await
    }

    pub async fn try_select_row_with(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> AdapterResult<Option<Row>> {
        self.try_run(sql, SelectRow, options).await
    }

    // -------------------------------------------------------------------------
    // select_scalar
    // -------------------------------------------------------------------------

    /// First value converted to `T`.
    ///
    /// `None` means the call failed; `Some(r)` with `r.is_db_null()` means the
    /// database returned NULL or no rows.
    pub async fn select_scalar<T>(&self, sql: &str) -> Option<ScalarResult<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.select_scalar_with(sql, QueryOptions::default()).await
    }

    pub async fn select_scalar_with<T>(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Option<ScalarResult<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.try_select_scalar_with(sql, options).await.ok()
    }

    pub async fn try_select_scalar<T>(&self, sql: &str) -> AdapterResult<ScalarResult<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.try_select_scalar_with(sql, QueryOptions::default())
            .await
    }

    pub async fn try_select_scalar_with<T>(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> AdapterResult<ScalarResult<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.try_run(sql, SelectScalar::<T>::default(), options)
            .await
    }

    // -------------------------------------------------------------------------
    // select_reader
    // -------------------------------------------------------------------------

    /// Stream rows into `on_row`; returns the rows visited (0 on failure).
    pub async fn select_reader<F>(&self, sql: &str, on_row: F) -> u64
    where
        F: FnMut(Row) + Send,
    {
        self.select_reader_with(sql, QueryOptions::default(), on_row)
            .await
    }

    pub async fn select_reader_with<F>(&self, sql: &str, options: QueryOptions, on_row: F) -> u64
    where
        F: FnMut(Row) + Send,
    {
        self.run(sql, SelectReader::new(on_row), options).await
    }

    pub async fn try_select_reader<F>(&self, sql: &str, on_row: F) -> AdapterResult<u64>
    where
        F: FnMut(Row) + Send,
    {
        self.try_select_reader_with(sql, QueryOptions::default(), on_row)
            .await
    }

    pub async fn try_select_reader_with<F>(
        &self,
        sql: &str,
        options: QueryOptions,
        on_row: F,
    ) -> AdapterResult<u64>
    where
        F: FnMut(Row) + Send,
    {
        self.try_run(sql, SelectReader::new(on_row), options).await
    }

    // -------------------------------------------------------------------------
    // helpers
    // -------------------------------------------------------------------------

    /// Current server time (`SELECT NOW();`).
    pub async fn server_time(&self) -> AdapterResult<NaiveDateTime> {
        self.try_select_scalar::<NaiveDateTime>("SELECT NOW();")
            .await?
            .into_value()
            .ok_or_else(|| AdapterError::Decode {
                message: "NOW() returned NULL".to_string(),
            })
    }

    /// Escape a value for use inside a single- or double-quoted MySQL string.
    pub fn escape_string(value: &str) -> String {
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '\0' => escaped.push_str("\\0"),
                '\n' => escaped.push_str("\\n"),
                '\r' => escaped.push_str("\\r"),
                '\\' => escaped.push_str("\\\\"),
                '\'' => escaped.push_str("\\'"),
                '"' => escaped.push_str("\\\""),
                '\x1a' => escaped.push_str("\\Z"),
                other => escaped.push(other),
            }
        }
        escaped
    }
}

impl fmt::Debug for MySqlAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlAdapter")
            .field("connection_string", &self.inner.connection_string)
            .field("options", &self.inner.options)
            .field("running_queries", &self.running_queries())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`MySqlAdapter`].
pub struct AdapterBuilder {
    connection_string: Result<ConnectionString, AdapterError>,
    options: AdapterOptions,
    handlers: ErrorHandlers,
    on_error: Option<ErrorObserver>,
    on_error_processed: Option<ErrorObserver>,
    connector: Option<Arc<dyn Connector>>,
}

impl AdapterBuilder {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self::with_connection(
            ConnectionString::new(connection_string)
                .map_err(|e| AdapterError::config(e.to_string())),
        )
    }

    /// Start from a named entry of a connection file.
    pub fn from_file(name: &str, path: impl AsRef<Path>) -> AdapterResult<Self> {
        if name.trim().is_empty() {
            return Err(AdapterError::config("connection name cannot be empty"));
        }
        let connection_string = ConnectionFile::load(path)?.get(name)?;
        Ok(Self::with_connection(Ok(connection_string)))
    }

    fn with_connection(connection_string: Result<ConnectionString, AdapterError>) -> Self {
        Self {
            connection_string,
            options: AdapterOptions::default(),
            handlers: ErrorHandlers::with_defaults(),
            on_error: None,
            on_error_processed: None,
            connector: None,
        }
    }

    pub fn options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn retry_on_error(mut self, retry: bool) -> Self {
        self.options.retry_on_error = retry;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.options.retry_interval = interval;
        self
    }

    pub fn command_timeout(mut self, timeout: CommandTimeout) -> Self {
        self.options.command_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.options.max_attempts = Some(attempts);
        self
    }

    /// Register (or replace) a handler.
    pub fn handler(mut self, code: ErrorCode, handler: ErrorHandler) -> Self {
        self.handlers.register(code, handler);
        self
    }

    /// Drop a handler, including one of the defaults.
    pub fn without_handler(mut self, code: ErrorCode) -> Self {
        self.handlers.remove(code);
        self
    }

    /// Replace the whole registry.
    pub fn handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Fatal-error observer.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&DriverError, &QueryContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Handled-error observer.
    pub fn on_error_processed<F>(mut self, f: F) -> Self
    where
        F: Fn(&DriverError, &QueryContext) + Send + Sync + 'static,
    {
        self.on_error_processed = Some(Arc::new(f));
        self
    }

    /// Use a custom connector instead of [`MySqlConnector`].
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> AdapterResult<MySqlAdapter> {
        let connection_string = self.connection_string?;
        self.options.validate().map_err(AdapterError::config)?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                // Fail fast on strings the driver would reject at first use
                connect_options(&connection_string)
                    .map_err(|e| AdapterError::config(e.to_string()))?;
                Arc::new(MySqlConnector::new())
            }
        };

        debug!(
            connection = %connection_string,
            handled_codes = ?self.handlers.codes(),
            "Created MySQL adapter"
        );

        Ok(MySqlAdapter {
            inner: Arc::new(AdapterInner {
                connection_string,
                connector,
                options: self.options,
                handlers: RwLock::new(self.handlers),
                on_error: self.on_error,
                on_error_processed: self.on_error_processed,
                running: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}
