//! Structured multi-row inserts.
//!
//! An [`InsertBuffer`] grows one `INSERT ... VALUES (..),(..)` statement.
//! The header is fixed at construction and is never touched by reject,
//! replace or flush.

use super::batch::{AddOutcome, Batch, FlushObserver, FlushOutcome, Layout};
use super::sync::SyncTask;
use super::value::InsertValue;
use crate::db::MySqlAdapter;
use crate::error::{AdapterError, AdapterResult};
use crate::models::QueryOptions;
use chrono::{DateTime, Local};
use regex::{Captures, Regex};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Batches rows into one multi-row INSERT.
pub struct InsertBuffer {
    batch: Arc<Batch>,
    table: String,
    columns: Vec<String>,
    sync: Mutex<Option<SyncTask>>,
}

/// Builder for [`InsertBuffer`].
pub struct InsertBufferBuilder {
    adapter: MySqlAdapter,
    table: String,
    columns: Vec<String>,
    insert_ignore: bool,
    batch_size: usize,
    sync_interval: Option<Duration>,
    on_flush: Option<FlushObserver>,
}

impl InsertBufferBuilder {
    /// Use `INSERT IGNORE` instead of `INSERT`.
    pub fn insert_ignore(mut self, ignore: bool) -> Self {
        self.insert_ignore = ignore;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    pub fn on_flush<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlushOutcome) + Send + Sync + 'static,
    {
        self.on_flush = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> AdapterResult<InsertBuffer> {
        if self.table.trim().is_empty() {
            return Err(AdapterError::config("insert table cannot be empty"));
        }
        if self.columns.is_empty() || self.columns.iter().any(|c| c.trim().is_empty()) {
            return Err(AdapterError::config("insert columns cannot be empty"));
        }

        let header = format!(
            "INSERT {}INTO {}({}) VALUES ",
            if self.insert_ignore { "IGNORE " } else { "" },
            self.table,
            self.columns.join(",")
        );
        let batch = Arc::new(Batch::new(
            self.adapter,
            Layout::Insert,
            header,
            self.batch_size,
            "insert_buffer",
            self.on_flush,
        ));
        let sync = self
            .sync_interval
            .map(|interval| SyncTask::spawn(&batch, interval))
            .transpose()?;

        Ok(InsertBuffer {
            batch,
            table: self.table,
            columns: self.columns,
            sync: Mutex::new(sync),
        })
    }
}

impl InsertBuffer {
    pub fn builder<I, S>(adapter: MySqlAdapter, table: impl Into<String>, columns: I) -> InsertBufferBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InsertBufferBuilder {
            adapter,
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            insert_ignore: false,
            batch_size: 0,
            sync_interval: None,
            on_flush: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The fixed `INSERT ... VALUES ` header.
    pub fn header(&self) -> &str {
        self.batch.prefix()
    }

    /// Append a pre-formatted tuple body, e.g. `'1','abc',NULL`.
    pub async fn add_raw(&self, values: &str) -> AdapterResult<AddOutcome> {
        let values = values.trim();
        if values.is_empty() {
            return Err(AdapterError::invalid_input("row has no values"));
        }
        Ok(self.batch.add(&format!("({values}),")).await)
    }

    /// Append a row of text values, each quoted verbatim.
    pub async fn add_strings<I, S>(&self, values: I) -> AdapterResult<AddOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let quoted: Vec<String> = values
            .into_iter()
            .map(|v| format!("'{}'", v.as_ref()))
            .collect();
        self.add_quoted(&quoted).await
    }

    /// Append a row of typed values.
    pub async fn add_values<I>(&self, values: I) -> AdapterResult<AddOutcome>
    where
        I: IntoIterator<Item = InsertValue>,
    {
        let quoted: Vec<String> = values.into_iter().map(|v| v.quoted()).collect();
        self.add_quoted(&quoted).await
    }

    async fn add_quoted(&self, quoted: &[String]) -> AdapterResult<AddOutcome> {
        if quoted.is_empty() {
            return Err(AdapterError::invalid_input("row has no values"));
        }
        Ok(self.batch.add(&tuple(quoted)).await)
    }

    /// Start composing a row value by value.
    pub fn begin_add(&self) -> AdapterResult<()> {
        self.batch.begin_row()
    }

    /// Add one value to the row being composed.
    pub fn add_single(&self, value: impl Into<InsertValue>) -> AdapterResult<()> {
        self.batch.push_to_row(value.into().quoted())
    }

    /// Finish the composed row. With `apply` and at least one value the row is
    /// appended (and may trigger a flush); otherwise it is discarded.
    pub async fn end_add(&self, apply: bool) -> AdapterResult<AddOutcome> {
        self.batch.end_row(apply, tuple).await
    }

    pub fn is_composing(&self) -> bool {
        self.batch.is_composing()
    }

    pub fn reject(&self, n: usize) -> AdapterResult<usize> {
        self.batch.reject(n)
    }

    pub fn replace(&self, pattern: &Regex, replacement: &str) -> usize {
        self.batch.replace(pattern, replacement)
    }

    pub fn replace_with<F>(&self, pattern: &Regex, replacer: F) -> usize
    where
        F: FnMut(&Captures<'_>) -> String,
    {
        self.batch.replace_with(pattern, replacer)
    }

    /// Submit all pending rows.
    pub async fn insert(&self) -> FlushOutcome {
        self.batch.flush(QueryOptions::default()).await
    }

    pub async fn insert_with(&self, options: QueryOptions) -> FlushOutcome {
        self.batch.flush(options).await
    }

    pub fn count(&self) -> usize {
        self.batch.count()
    }

    /// Statement the next insert would submit, `;`-terminated.
    pub fn query(&self) -> Option<String> {
        self.batch.query()
    }

    pub fn batch_size(&self) -> usize {
        self.batch.batch_size()
    }

    pub fn is_sync_paused(&self) -> bool {
        self.batch.is_paused()
    }

    pub fn set_sync_paused(&self, paused: bool) {
        self.batch.set_paused(paused);
    }

    pub fn last_sync(&self) -> Option<DateTime<Local>> {
        self.batch.last_sync()
    }

    pub fn adapter(&self) -> &MySqlAdapter {
        self.batch.adapter()
    }

    /// Stop the timer and insert what is left.
    ///
    /// An in-flight timer insert is awaited, including its retries. During a
    /// lasting outage that wait only ends once [`MySqlAdapter::close`]
    /// abandons the retry sleep; use [`close_within`](Self::close_within) to
    /// bound it instead.
    pub async fn close(&self) -> FlushOutcome {
        self.shutdown(None).await
    }

    /// Like [`close`](Self::close), but aborts an in-flight timer insert that
    /// has not finished within `grace`. The aborted batch is lost.
    pub async fn close_within(&self, grace: Duration) -> FlushOutcome {
        self.shutdown(Some(grace)).await
    }

    async fn shutdown(&self, grace: Option<Duration>) -> FlushOutcome {
        let task = self
            .sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop(grace).await;
        }
        self.insert().await
    }
}

fn tuple(quoted: &[String]) -> String {
    format!("({}),", quoted.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(ignore: bool) -> InsertBuffer {
        let adapter = MySqlAdapter::new("Host=localhost").unwrap();
        InsertBuffer::builder(adapter, "events", ["id", "name"])
            .insert_ignore(ignore)
            .build()
            .unwrap()
    }

    #[test]
    fn test_header() {
        assert_eq!(buffer(false).header(), "INSERT INTO events(id,name) VALUES ");
        assert_eq!(
            buffer(true).header(),
            "INSERT IGNORE INTO events(id,name) VALUES "
        );
    }

    #[test]
    fn test_build_requires_columns() {
        let adapter = MySqlAdapter::new("Host=localhost").unwrap();
        let result = InsertBuffer::builder(adapter, "events", Vec::<String>::new()).build();
        assert!(matches!(result, Err(AdapterError::Config { .. })));
    }

    #[tokio::test]
    async fn test_add_variants() {
        let b = buffer(false);
        b.add_raw("'1','a'").await.unwrap();
        b.add_strings(["2", "b"]).await.unwrap();
        b.add_values([InsertValue::from(3i64), InsertValue::from(1.25f64)])
            .await
            .unwrap();
        assert_eq!(
            b.query().as_deref(),
            Some("INSERT INTO events(id,name) VALUES ('1','a'),('2','b'),('3','1.25');")
        );
    }

    #[tokio::test]
    async fn test_empty_rows_rejected() {
        let b = buffer(false);
        assert!(matches!(
            b.add_raw("  ").await,
            Err(AdapterError::InvalidInput { .. })
        ));
        assert!(matches!(
            b.add_strings(Vec::<String>::new()).await,
            Err(AdapterError::InvalidInput { .. })
        ));
        assert_eq!(b.count(), 0);
    }

    #[tokio::test]
    async fn test_compose_row() {
        let b = buffer(false);
        b.begin_add().unwrap();
        b.add_single(7).unwrap();
        b.add_single("x").unwrap();
        assert_eq!(b.insert().await, FlushOutcome::Deferred);
        assert_eq!(b.end_add(true).await.unwrap(), AddOutcome::Pending(1));
        assert!(!b.is_composing());
        assert_eq!(
            b.query().as_deref(),
            Some("INSERT INTO events(id,name) VALUES ('7','x');")
        );
    }

    #[tokio::test]
    async fn test_discarded_compositions() {
        let b = buffer(false);
        b.begin_add().unwrap();
        b.add_single("x").unwrap();
        assert_eq!(b.end_add(false).await.unwrap(), AddOutcome::Pending(0));

        b.begin_add().unwrap();
        assert_eq!(b.end_add(true).await.unwrap(), AddOutcome::Pending(0));
        assert!(b.query().is_none());

        assert!(matches!(
            b.end_add(true).await,
            Err(AdapterError::Composition { .. })
        ));
        assert!(matches!(
            b.add_single("x"),
            Err(AdapterError::Composition { .. })
        ));
    }
}
