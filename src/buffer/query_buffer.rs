//! Statement batching.
//!
//! A [`QueryBuffer`] collects free-form statements and submits them as one
//! multi-statement round trip, either when the batch size is reached, when
//! the sync timer fires or when [`QueryBuffer::flush`] is called.
//!
//! ```text
//! START TRANSACTION;      <- prefix (transactional mode only)
//! UPDATE a SET x = 1;     <- item 0
//! DELETE FROM b;          <- item 1
//! COMMIT;                 <- appended on flush
//! ```

use super::batch::{AddOutcome, Batch, FlushObserver, FlushOutcome, Layout};
use super::sync::SyncTask;
use crate::db::MySqlAdapter;
use crate::error::AdapterResult;
use crate::models::QueryOptions;
use chrono::{DateTime, Local};
use regex::{Captures, Regex};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const TRANSACTION_PREFIX: &str = "START TRANSACTION;\n";

/// Batches SQL statements into single round trips.
pub struct QueryBuffer {
    batch: Arc<Batch>,
    transactional: bool,
    sync: Mutex<Option<SyncTask>>,
}

/// Builder for [`QueryBuffer`].
pub struct QueryBufferBuilder {
    adapter: MySqlAdapter,
    batch_size: usize,
    transactional: bool,
    sync_interval: Option<Duration>,
    on_flush: Option<FlushObserver>,
}

impl QueryBufferBuilder {
    /// Flush automatically once this many statements are pending (0 = never).
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Wrap every batch in `START TRANSACTION; ... COMMIT;`.
    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// Flush on a timer. Requires a tokio runtime at build time.
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

    pub fn build(self) -> AdapterResult<QueryBuffer> {
        let prefix = if self.transactional {
            TRANSACTION_PREFIX.to_string()
        } else {
            String::new()
        };
        let batch = Arc::new(Batch::new(
            self.adapter,
            Layout::Statements {
                transactional: self.transactional,
            },
            prefix,
            self.batch_size,
            "query_buffer",
            self.on_flush,
        ));
        let sync = self
            .sync_interval
            .map(|interval| SyncTask::spawn(&batch, interval))
            .transpose()?;
        Ok(QueryBuffer {
            batch,
            transactional: self.transactional,
            sync: Mutex::new(sync),
        })
    }
}

impl QueryBuffer {
    /// Plain buffer: no batch size, no transaction, no timer.
    pub fn new(adapter: MySqlAdapter) -> Self {
        Self {
            batch: Arc::new(Batch::new(
                adapter,
                Layout::Statements {
                    transactional: false,
                },
                String::new(),
                0,
                "query_buffer",
                None,
            )),
            transactional: false,
            sync: Mutex::new(None),
        }
    }

    pub fn builder(adapter: MySqlAdapter) -> QueryBufferBuilder {
        QueryBufferBuilder {
            adapter,
            batch_size: 0,
            transactional: false,
            sync_interval: None,
            on_flush: None,
        }
    }

    /// Append one statement.
    ///
    /// Leading and trailing line breaks are trimmed and a missing `;` is added.
    /// A statement that is empty after trimming is ignored.
    pub async fn add(&self, statement: &str) -> AddOutcome {
        let statement = statement.trim_matches(&['\r', '\n'][..]);
        if statement.trim().is_empty() {
            return AddOutcome::Pending(self.batch.count());
        }
        let mut item = String::with_capacity(statement.len() + 2);
        item.push_str(statement);
        if !statement.ends_with(';') {
            item.push(';');
        }
        item.push('\n');
        self.batch.add(&item).await
    }

    /// Drop the last `n` pending statements.
    pub fn reject(&self, n: usize) -> AdapterResult<usize> {
        self.batch.reject(n)
    }

    /// Regex replacement applied to each pending statement (`$1` style
    /// references are expanded). Returns the number of statements changed.
    pub fn replace(&self, pattern: &Regex, replacement: &str) -> usize {
        self.batch.replace(pattern, replacement)
    }

    /// Like [`replace`](Self::replace) with a computed replacement.
    pub fn replace_with<F>(&self, pattern: &Regex, replacer: F) -> usize
    where
        F: FnMut(&Captures<'_>) -> String,
    {
        self.batch.replace_with(pattern, replacer)
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.batch.flush(QueryOptions::default()).await
    }

    /// Flush with a per-call timeout or retry override.
    pub async fn flush_with(&self, options: QueryOptions) -> FlushOutcome {
        self.batch.flush(options).await
    }

    pub fn count(&self) -> usize {
        self.batch.count()
    }

    /// Statement the next flush would submit, or `None` when empty.
    pub fn query(&self) -> Option<String> {
        self.batch.query()
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn batch_size(&self) -> usize {
        self.batch.batch_size()
    }

    pub fn is_sync_paused(&self) -> bool {
        self.batch.is_paused()
    }

    /// While paused every flush is a no-op and pending statements are kept.
    pub fn set_sync_paused(&self, paused: bool) {
        self.batch.set_paused(paused);
    }

    /// Time of the last flush that reached the database.
    pub fn last_sync(&self) -> Option<DateTime<Local>> {
        self.batch.last_sync()
    }

    pub fn adapter(&self) -> &MySqlAdapter {
        self.batch.adapter()
    }

    /// Stop the timer (waiting for an in-flight tick) and flush what is left.
    ///
    /// An in-flight timer flush is awaited, including its retries. During a
    /// lasting outage that wait only ends once [`MySqlAdapter::close`]
    /// abandons the retry sleep; use [`close_within`](Self::close_within) to
    /// bound it instead.
    pub async fn close(&self) -> FlushOutcome {
        self.shutdown(None).await
    }

    /// Like [`close`](Self::close), but aborts an in-flight timer flush that
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
        self.flush().await
    }
}
