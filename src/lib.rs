//! MySQL Adapter Library
//!
//! A convenience layer over MySQL: a retrying execution core with per-error
//! handlers and observers, statement and insert batching buffers with
//! optional background sync, and a small read-through cache.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use buffer::{AddOutcome, FlushOutcome, InsertBuffer, InsertValue, QueryBuffer};
pub use cache::{CacheOptions, CacheQuery, CacheRegistry};
pub use config::{AdapterOptions, Config, ConnectionFile};
pub use db::{DriverError, ErrorCode, ErrorHandler, MySqlAdapter};
pub use error::{AdapterError, AdapterResult};
pub use models::{CommandTimeout, QueryContext, QueryOptions, Row, ScalarResult, Table};
