//! Per-error-code handler registry.
//!
//! A code with a registered handler is "handled": the handler runs, the
//! error-processed observer fires and the call may retry. A code without a
//! handler is fatal for the current call.

use crate::db::failure::{DriverError, ErrorCode};
use crate::models::{CommandTimeout, QueryContext};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Callback that may adjust the context before the next attempt.
pub type AdjustFn = Arc<dyn Fn(&DriverError, &mut QueryContext) + Send + Sync>;

/// What to do with a handled error code.
#[derive(Clone)]
pub enum ErrorHandler {
    /// Benign: leave the context untouched and allow a retry.
    Suppress,
    /// Run a callback that may change timeout or retry before the next attempt.
    Adjust(AdjustFn),
}

impl ErrorHandler {
    /// Wrap a closure as an adjusting handler.
    pub fn adjust<F>(f: F) -> Self
    where
        F: Fn(&DriverError, &mut QueryContext) + Send + Sync + 'static,
    {
        Self::Adjust(Arc::new(f))
    }

    /// Handler used for command timeouts: lift the limit for the next attempt.
    pub fn lift_timeout() -> Self {
        Self::adjust(|_, ctx| ctx.command_timeout = CommandTimeout::Unlimited)
    }

    pub(crate) fn apply(&self, err: &DriverError, ctx: &mut QueryContext) {
        if let Self::Adjust(f) = self {
            f(err, ctx);
        }
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suppress => write!(f, "Suppress"),
            Self::Adjust(_) => write!(f, "Adjust(..)"),
        }
    }
}

/// Registry of handled error codes.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandlers {
    handlers: HashMap<ErrorCode, ErrorHandler>,
}

impl ErrorHandlers {
    /// A registry with nothing handled: every failure is fatal.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The default set.
    ///
    /// - `1042` bad host, `1205` lock wait timeout, `1213` deadlock: suppress
    /// - [`ErrorCode::TIMEOUT`]: lift the command timeout
    /// - [`ErrorCode::CATCH_ALL`]: suppress
    pub fn with_defaults() -> Self {
        let mut handlers = Self::empty();
        handlers.register(ErrorCode::BAD_HOST, ErrorHandler::Suppress);
        handlers.register(ErrorCode::LOCK_WAIT_TIMEOUT, ErrorHandler::Suppress);
        handlers.register(ErrorCode::LOCK_DEADLOCK, ErrorHandler::Suppress);
        handlers.register(ErrorCode::TIMEOUT, ErrorHandler::lift_timeout());
        handlers.register(ErrorCode::CATCH_ALL, ErrorHandler::Suppress);
        handlers
    }

    /// Register (or replace) the handler for `code`.
    pub fn register(&mut self, code: ErrorCode, handler: ErrorHandler) -> Option<ErrorHandler> {
        self.handlers.insert(code, handler)
    }

    /// Remove the handler for `code`, making it fatal.
    pub fn remove(&mut self, code: ErrorCode) -> Option<ErrorHandler> {
        self.handlers.remove(&code)
    }

    pub fn get(&self, code: ErrorCode) -> Option<&ErrorHandler> {
        self.handlers.get(&code)
    }

    pub fn is_handled(&self, code: ErrorCode) -> bool {
        self.handlers.contains_key(&code)
    }

    /// Handled codes in ascending order.
    pub fn codes(&self) -> Vec<ErrorCode> {
        let mut codes: Vec<ErrorCode> = self.handlers.keys().copied().collect();
        codes.sort();
        codes
    }
}
