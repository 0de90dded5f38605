//! Accumulator shared by [`QueryBuffer`](super::QueryBuffer) and
//! [`InsertBuffer`](super::InsertBuffer).
//!
//! Text and item offsets move together under one state lock. The pending
//! counter mirrors `offsets.len()` so `count()` never blocks. Flushes are
//! serialized by an async gate taken before the snapshot; the state lock is
//! released before the database round trip starts.

use crate::db::MySqlAdapter;
use crate::error::{AdapterError, AdapterResult};
use crate::models::QueryOptions;
use chrono::{DateTime, Local};
use regex::{Captures, Regex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Observer invoked after every flush that reached the database.
pub type FlushObserver = Arc<dyn Fn(&FlushOutcome) + Send + Sync>;

/// Result of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The batch ran; `items` buffered entries were submitted.
    Executed { rows_affected: u64, items: usize },
    /// The batch was submitted and failed; its items are gone.
    Failed { items: usize },
    /// Nothing was pending.
    Empty,
    /// Syncing is paused; pending items were kept.
    Paused,
    /// A row is being composed; pending items were kept.
    Deferred,
}

impl FlushOutcome {
    /// Legacy integer form: affected rows, `0` for a failed batch and `-1`
    /// when nothing was submitted.
    pub fn rows(&self) -> i64 {
        match self {
            Self::Executed { rows_affected, .. } => {
                i64::try_from(*rows_affected).unwrap_or(i64::MAX)
            }
            Self::Failed { .. } => 0,
            Self::Empty | Self::Paused | Self::Deferred => -1,
        }
    }

    /// Whether a statement was sent to the database.
    pub fn submitted(&self) -> bool {
        matches!(self, Self::Executed { .. } | Self::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }
}

/// Result of adding one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Item buffered; the value is the pending count.
    Pending(usize),
    /// The item reached the batch size and triggered a flush.
    Flushed(FlushOutcome),
}

impl AddOutcome {
    pub fn is_flushed(&self) -> bool {
        matches!(self, Self::Flushed(_))
    }
}

/// How the accumulated text becomes a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    /// `;`-terminated statements, optionally wrapped in a transaction.
    Statements { transactional: bool },
    /// `(..),` tuples after an `INSERT ... VALUES ` header.
    Insert,
}

impl Layout {
    /// Statement submitted on flush.
    fn finalize(self, text: &str) -> String {
        match self {
            Self::Statements { transactional: true } => format!("{text}COMMIT;"),
            Self::Statements { transactional: false } => text.to_string(),
            Self::Insert => text.strip_suffix(',').unwrap_or(text).to_string(),
        }
    }

    /// Text shown by `query()`.
    fn preview(self, text: &str) -> String {
        match self {
            Self::Insert => format!("{};", self.finalize(text)),
            statements => statements.finalize(text),
        }
    }
}

#[derive(Debug)]
struct BatchState {
    text: String,
    /// Start offset of each pending item in `text`.
    offsets: Vec<usize>,
    /// Values of a row being composed.
    row: Option<Vec<String>>,
}

pub(crate) struct Batch {
    adapter: MySqlAdapter,
    layout: Layout,
    prefix: String,
    batch_size: usize,
    label: &'static str,
    state: Mutex<BatchState>,
    pending: AtomicUsize,
    paused: AtomicBool,
    flush_gate: tokio::sync::Mutex<()>,
    last_sync: Mutex<Option<DateTime<Local>>>,
    on_flush: Option<FlushObserver>,
}

impl Batch {
    pub(crate) fn new(
        adapter: MySqlAdapter,
        layout: Layout,
        prefix: String,
        batch_size: usize,
        label: &'static str,
        on_flush: Option<FlushObserver>,
    ) -> Self {
        Self {
            adapter,
            layout,
            state: Mutex::new(BatchState {
                text: prefix.clone(),
                offsets: Vec::new(),
                row: None,
            }),
            prefix,
            batch_size,
            label,
            pending: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            flush_gate: tokio::sync::Mutex::new(()),
            last_sync: Mutex::new(None),
            on_flush,
        }
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn adapter(&self) -> &MySqlAdapter {
        &self.adapter
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn last_sync(&self) -> Option<DateTime<Local>> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one fully formatted item and flush when the batch is full.
    pub(crate) async fn add(&self, item: &str) -> AddOutcome {
        let count = {
            let mut state = self.state();
            let start = state.text.len();
            state.offsets.push(start);
            state.text.push_str(item);
            let count = state.offsets.len();
            self.pending.store(count, Ordering::SeqCst);
            count
        };
        self.after_add(count).await
    }

    async fn after_add(&self, count: usize) -> AddOutcome {
        if self.batch_size > 0 && count >= self.batch_size {
            AddOutcome::Flushed(self.flush(QueryOptions::default()).await)
        } else {
            AddOutcome::Pending(count)
        }
    }

    /// Drop the last `n` pending items. Returns the remaining count.
    pub(crate) fn reject(&self, n: usize) -> AdapterResult<usize> {
        let mut state = self.state();
        let pending = state.offsets.len();
        if n > pending {
            return Err(AdapterError::RejectOutOfRange {
                requested: n,
                pending,
            });
        }
        let keep = pending - n;
        if let Some(&cut) = state.offsets.get(keep) {
            state.text.truncate(cut);
            state.offsets.truncate(keep);
        }
        self.pending.store(keep, Ordering::SeqCst);
        debug!(buffer = self.label, rejected = n, pending = keep, "Rejected items");
        Ok(keep)
    }

    /// Rewrite every pending item with `rewrite`. Returns how many changed.
    fn rewrite(&self, mut rewrite: impl FnMut(&str) -> String) -> usize {
        let mut state = self.state();
        let mut text = String::with_capacity(state.text.len());
        text.push_str(&state.text[..self.prefix.len()]);
        let mut offsets = Vec::with_capacity(state.offsets.len());
        let mut changed = 0;

        for (i, &start) in state.offsets.iter().enumerate() {
            let end = state
                .offsets
                .get(i + 1)
                .copied()
                .unwrap_or(state.text.len());
            let item = &state.text[start..end];
            let replaced = rewrite(item);
            if replaced != item {
                changed += 1;
            }
            offsets.push(text.len());
            text.push_str(&replaced);
        }

        state.text = text;
        state.offsets = offsets;
        changed
    }

    pub(crate) fn replace(&self, pattern: &Regex, replacement: &str) -> usize {
        self.rewrite(|item| pattern.replace_all(item, replacement).into_owned())
    }

    pub(crate) fn replace_with<F>(&self, pattern: &Regex, mut replacer: F) -> usize
    where
        F: FnMut(&Captures<'_>) -> String,
    {
        self.rewrite(|item| {
            pattern
                .replace_all(item, |caps: &Captures<'_>| replacer(caps))
                .into_owned()
        })
    }

    /// Pending text as it would be submitted, or `None` when empty.
    pub(crate) fn query(&self) -> Option<String> {
        let state = self.state();
        if state.offsets.is_empty() {
            return None;
        }
        Some(self.layout.preview(&state.text))
    }

    pub(crate) fn begin_row(&self) -> AdapterResult<()> {
        let mut state = self.state();
        if state.row.is_some() {
            return Err(AdapterError::composition("a row is already being composed"));
        }
        state.row = Some(Vec::new());
        Ok(())
    }

    pub(crate) fn push_to_row(&self, value: String) -> AdapterResult<()> {
        match self.state().row.as_mut() {
            Some(row) => {
                row.push(value);
                Ok(())
            }
            None => Err(AdapterError::composition("no row is being composed")),
        }
    }

    /// Leave composition mode; append the row as one item when `apply` is set
    /// and the row has values.
    pub(crate) async fn end_row(
        &self,
        apply: bool,
        format: impl FnOnce(&[String]) -> String,
    ) -> AdapterResult<AddOutcome> {
        let count = {
            let mut state = self.state();
            let row = state
                .row
                .take()
                .ok_or_else(|| AdapterError::composition("no row is being composed"))?;
            if !apply || row.is_empty() {
                return Ok(AddOutcome::Pending(state.offsets.len()));
            }
            let item = format(&row);
            let start = state.text.len();
            state.offsets.push(start);
            state.text.push_str(&item);
            let count = state.offsets.len();
            self.pending.store(count, Ordering::SeqCst);
            count
        };
        Ok(self.after_add(count).await)
    }

    pub(crate) fn is_composing(&self) -> bool {
        self.state().row.is_some()
    }

    /// Submit everything pending as one statement.
    pub(crate) async fn flush(&self, options: QueryOptions) -> FlushOutcome {
        if self.is_paused() {
            return FlushOutcome::Paused;
        }
        let _gate = self.flush_gate.lock().await;
        if self.is_paused() {
            return FlushOutcome::Paused;
        }

        let (sql, items) = {
            let mut state = self.state();
            if state.row.is_some() {
                return FlushOutcome::Deferred;
            }
            if state.offsets.is_empty() {
                return FlushOutcome::Empty;
            }
            let items = state.offsets.len();
            let sql = self.layout.finalize(&state.text);
            state.text.truncate(self.prefix.len());
            state.offsets.clear();
            self.pending.store(0, Ordering::SeqCst);
            (sql, items)
        };

        let result = self.adapter.try_execute_with(&sql, options).await;
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(Local::now());

        let outcome = match result {
            Ok(rows_affected) => {
                info!(
                    buffer = self.label,
                    items = items,
                    rows_affected = rows_affected,
                    "Flushed batch"
                );
                FlushOutcome::Executed {
                    rows_affected,
                    items,
                }
            }
            Err(e) => {
                warn!(
                    buffer = self.label,
                    items = items,
                    error = %e,
                    "Batch failed, items dropped"
                );
                FlushOutcome::Failed { items }
            }
        };

        if let Some(observer) = &self.on_flush {
            observer(&outcome);
        }
        outcome
    }
}
