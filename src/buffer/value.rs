//! Typed values for [`InsertBuffer`](super::InsertBuffer) rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use std::fmt;

/// Sortable timestamp layout used for every temporal value.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One value of an inserted row.
///
/// Every variant renders inside single quotes. Text is inserted verbatim:
/// embedded quotes and backslashes are NOT escaped, so untrusted input must go
/// through [`MySqlAdapter::escape_string`](crate::db::MySqlAdapter::escape_string)
/// first.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertValue {
    Text(String),
    Float(f64),
    Timestamp(NaiveDateTime),
    Other(String),
}

impl InsertValue {
    /// Unquoted text form.
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) | Self::Other(s) => s.clone(),
            // Display ignores locale and never emits a decimal comma
            Self::Float(f) => f.to_string(),
            Self::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// Quoted form as it appears in a value tuple.
    pub fn quoted(&self) -> String {
        format!("'{}'", self.render())
    }
}

impl fmt::Display for InsertValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<String> for InsertValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for InsertValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for InsertValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for InsertValue {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl From<NaiveDateTime> for InsertValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl From<NaiveDate> for InsertValue {
    fn from(value: NaiveDate) -> Self {
        Self::Timestamp(value.and_hms_opt(0, 0, 0).unwrap_or_default())
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for InsertValue {
    fn from(value: DateTime<Tz>) -> Self {
        Self::Timestamp(value.naive_local())
    }
}

macro_rules! impl_other_from {
    ($($t:ty),+ $(,)?) => {
        $(
            impl From<$t> for InsertValue {
                fn from(value: $t) -> Self {
                    Self::Other(value.to_string())
                }
            }
        )+
    };
}

impl_other_from!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, usize, isize, bool, char);
