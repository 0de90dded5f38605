//! Classification of per-attempt database failures.
//!
//! Every failed attempt is turned into a [`DriverError`] carrying a stable
//! numeric [`ErrorCode`]. The execution core routes on that code to decide
//! between "handled, may retry" and "fatal".

use sqlx::error::DatabaseError as _;
use std::fmt;
use std::time::Duration;

/// Numeric key used to look up error handlers.
///
/// Server errors use the MySQL error number. Two synthetic codes exist:
/// [`ErrorCode::TIMEOUT`] for command timeouts and [`ErrorCode::CATCH_ALL`]
/// for any failure that did not come from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    /// Command or driver timeout.
    pub const TIMEOUT: ErrorCode = ErrorCode(0);
    /// Non-server failures (I/O, protocol, decoding).
    pub const CATCH_ALL: ErrorCode = ErrorCode(-1);
    /// ER_BAD_HOST_ERROR
    pub const BAD_HOST: ErrorCode = ErrorCode(1042);
    /// ER_LOCK_WAIT_TIMEOUT
    pub const LOCK_WAIT_TIMEOUT: ErrorCode = ErrorCode(1205);
    /// ER_LOCK_DEADLOCK
    pub const LOCK_DEADLOCK: ErrorCode = ErrorCode(1213);

    pub fn value(self) -> i32 {
        self.0
    }
}

impl From<u16> for ErrorCode {
    fn from(number: u16) -> Self {
        ErrorCode(i32::from(number))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ErrorCode::TIMEOUT => write!(f, "TIMEOUT"),
            ErrorCode::CATCH_ALL => write!(f, "CATCH_ALL"),
            ErrorCode(n) => write!(f, "{}", n),
        }
    }
}

/// A single failed attempt, as reported by a [`Connection`](super::Connection).
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// Error returned by the MySQL server.
    #[error("MySQL error {code}: {message}")]
    Database {
        code: u16,
        message: String,
        sql_state: Option<String>,
    },

    /// The command did not complete within its timeout.
    #[error("command timed out after {}s", .elapsed.as_secs())]
    Timeout { elapsed: Duration },

    /// The connection could not be opened or was lost.
    #[error("connection failure: {message}")]
    Connection { message: String },

    /// A returned value could not be converted.
    #[error("decode failure: {message}")]
    Decode { message: String },

    #[error("{message}")]
    Other { message: String },
}

impl DriverError {
    pub fn database(code: u16, message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            code,
            message: message.into(),
            sql_state,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// The handler key this failure is routed by.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Database { code, .. } => ErrorCode::from(*code),
            Self::Timeout { .. } => ErrorCode::TIMEOUT,
            Self::Connection { .. } | Self::Decode { .. } | Self::Other { .. } => {
                ErrorCode::CATCH_ALL
            }
        }
    }

    /// Whether the failure was reported by the server itself.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Database { .. })
    }
}

/// Convert sqlx errors into classified failures.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let sql_state = db_err.code().map(|c| c.to_string());
                match db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                    Some(mysql_err) => {
                        DriverError::database(mysql_err.number(), mysql_err.message(), sql_state)
                    }
                    None => DriverError::other(db_err.message()),
                }
            }
            sqlx::Error::Io(io_err) => DriverError::connection(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DriverError::connection(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DriverError::connection(format!("Protocol error: {}", msg)),
            sqlx::Error::Configuration(msg) => {
                DriverError::connection(format!("Configuration error: {}", msg))
            }
            sqlx::Error::PoolTimedOut => DriverError::Timeout {
                elapsed: Duration::ZERO,
            },
            sqlx::Error::ColumnDecode { index, source } => {
                DriverError::decode(format!("column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DriverError::decode(source.to_string()),
            other => DriverError::other(other.to_string()),
        }
    }
}
