//! Query-related data models.
//!
//! This module defines the per-call query context threaded through the retry
//! loop, per-call options, and the result shapes returned by the execution core.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;

/// One result row: column name to decoded value.
pub type Row = serde_json::Map<String, JsonValue>;

/// Time a single command may run before it is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandTimeout {
    Limited(Duration),
    Unlimited,
}

impl CommandTimeout {
    /// Build from whole seconds; `0` means no limit.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::Unlimited
        } else {
            Self::Limited(Duration::from_secs(secs))
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Limited(d) => Some(*d),
            Self::Unlimited => None,
        }
    }
}

impl fmt::Display for CommandTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(d) => write!(f, "{}ms", d.as_millis()),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Per-call overrides. `None` fields fall back to the adapter defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub timeout: Option<CommandTimeout>,
    pub retry: Option<bool>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: CommandTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable or disable retrying for this call.
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Mutable state of one top-level call.
///
/// Created fresh per call and passed by reference through every attempt.
/// Error handlers may adjust `command_timeout` or `retry` for the next attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub query: String,
    pub command_timeout: CommandTimeout,
    pub retry: bool,
    /// 1-based number of the attempt currently running (or last run).
    pub attempt: u32,
}

impl QueryContext {
    pub fn new(query: impl Into<String>, command_timeout: CommandTimeout, retry: bool) -> Self {
        Self {
            query: query.into(),
            command_timeout,
            retry,
            attempt: 0,
        }
    }
}

/// Tabular result of a SELECT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// First row, if any.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// First column of the first row.
    pub fn first_value(&self) -> Option<&JsonValue> {
        let row = self.rows.first()?;
        match self.columns.first() {
            Some(column) => row.get(column),
            None => row.values().next(),
        }
    }
}

/// Scalar query result. `value` is `None` when the database returned NULL
/// (or no row at all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarResult<T> {
    pub value: Option<T>,
}

impl<T> ScalarResult<T> {
    pub fn new(value: Option<T>) -> Self {
        Self { value }
    }

    pub fn db_null() -> Self {
        Self { value: None }
    }

    pub fn is_db_null(&self) -> bool {
        self.value.is_none()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }
}
