//! Shared test helpers: an in-memory connector that replays scripted replies.

#![allow(dead_code)]

use async_trait::async_trait;
use mysql_adapter::db::{AdapterBuilder, Connection, Connector, DriverError, ErrorCode};
use mysql_adapter::models::{CommandTimeout, ConnectionString, QueryContext, Row, Table};
use mysql_adapter::MySqlAdapter;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What one attempt returns.
#[derive(Debug, Clone)]
pub enum Reply {
    Affected(u64),
    Rows(Table),
    /// One table per statement; `query` sees only the first.
    Sets(Vec<Table>),
    Fail(DriverError),
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<(String, CommandTimeout)>>,
    delay: Mutex<Option<Duration>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Connector whose connections pop replies from a shared script.
///
/// An empty script answers `execute` with one affected row and `query` with
/// an empty table.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: Reply) -> &Self {
        self.shared.script.lock().unwrap().push_back(reply);
        self
    }

    pub fn push_error(&self, code: u16) -> &Self {
        self.push(Reply::Fail(DriverError::database(
            code,
            format!("server error {code}"),
            None,
        )))
    }

    pub fn push_rows(&self, table: Table) -> &Self {
        self.push(Reply::Rows(table))
    }

    pub fn push_sets(&self, tables: Vec<Table>) -> &Self {
        self.push(Reply::Sets(tables))
    }

    /// Delay every command by `delay` before replying.
    pub fn set_delay(&self, delay: Duration) {
        *self.shared.delay.lock().unwrap() = Some(delay);
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// SQL of every command, in arrival order.
    pub fn statements(&self) -> Vec<String> {
        self.shared
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    /// Timeout passed with every command.
    pub fn timeouts(&self) -> Vec<CommandTimeout> {
        self.shared
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| *t)
            .collect()
    }

    /// Adapter builder wired to this connector with a short retry interval.
    pub fn builder(&self) -> AdapterBuilder {
        MySqlAdapter::builder("Host=scripted; Database=test")
            .connector(Arc::new(self.clone()))
            .retry_interval(Duration::from_millis(10))
    }

    pub fn adapter(&self) -> MySqlAdapter {
        self.builder().build().unwrap()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        _connection_string: &ConnectionString,
    ) -> Result<Box<dyn Connection>, DriverError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct ScriptedConnection {
    shared: Arc<Shared>,
}

impl ScriptedConnection {
    async fn next(&self, sql: &str, timeout: CommandTimeout) -> Option<Reply> {
        self.shared
            .calls
            .lock()
            .unwrap()
            .push((sql.to_string(), timeout));
        let delay = *self.shared.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.shared.script.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn execute(&mut self, sql: &str, timeout: CommandTimeout) -> Result<u64, DriverError> {
        match self.next(sql, timeout).await {
            None => Ok(1),
            Some(Reply::Affected(n)) => Ok(n),
            Some(Reply::Rows(table)) => Ok(table.len() as u64),
            Some(Reply::Sets(tables)) => Ok(tables.iter().map(|t| t.len() as u64).sum()),
            Some(Reply::Fail(err)) => Err(err),
        }
    }

    async fn query(&mut self, sql: &str, timeout: CommandTimeout) -> Result<Table, DriverError> {
        match self.next(sql, timeout).await {
            None | Some(Reply::Affected(_)) => Ok(Table::default()),
            Some(Reply::Rows(table)) => Ok(table),
            Some(Reply::Sets(tables)) => Ok(tables.into_iter().next().unwrap_or_default()),
            Some(Reply::Fail(err)) => Err(err),
        }
    }

    async fn query_sets(
        &mut self,
        sql: &str,
        timeout: CommandTimeout,
    ) -> Result<Vec<Table>, DriverError> {
        match self.next(sql, timeout).await {
            None | Some(Reply::Affected(_)) => Ok(vec![Table::default()]),
            Some(Reply::Rows(table)) => Ok(vec![table]),
            Some(Reply::Sets(tables)) => Ok(tables),
            Some(Reply::Fail(err)) => Err(err),
        }
    }

    async fn query_each(
        &mut self,
        sql: &str,
        timeout: CommandTimeout,
        on_row: &mut (dyn FnMut(Row) + Send),
    ) -> Result<u64, DriverError> {
        let table = self.query(sql, timeout).await?;
        let count = table.rows.len() as u64;
        for row in table.rows {
            on_row(row);
        }
        Ok(count)
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Build a table from column names and row values.
pub fn table(columns: &[&str], rows: Vec<Vec<JsonValue>>) -> Table {
    Table {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: rows
            .into_iter()
            .map(|values| {
                columns
                    .iter()
                    .map(|c| c.to_string())
                    .zip(values)
                    .collect::<Row>()
            })
            .collect(),
    }
}

/// Records observer calls.
#[derive(Clone, Default)]
pub struct Observed {
    calls: Arc<Mutex<Vec<(ErrorCode, QueryContext)>>>,
}

impl Observed {
    pub fn record(&self, err: &DriverError, ctx: &QueryContext) {
        self.calls.lock().unwrap().push((err.code(), ctx.clone()));
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn codes(&self) -> Vec<ErrorCode> {
        self.calls.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    pub fn contexts(&self) -> Vec<QueryContext> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ctx)| ctx.clone())
            .collect()
    }
}

/// Adapter builder with both observers recording into the returned handles.
pub fn observed_builder(connector: &ScriptedConnector) -> (AdapterBuilder, Observed, Observed) {
    let errors = Observed::default();
    let processed = Observed::default();
    let (e, p) = (errors.clone(), processed.clone());
    let builder = connector
        .builder()
        .on_error(move |err, ctx| e.record(err, ctx))
        .on_error_processed(move |err, ctx| p.record(err, ctx));
    (builder, errors, processed)
}
