//! Batching buffers.
//!
//! - [`QueryBuffer`]: free-form statements, optionally transactional
//! - [`InsertBuffer`]: rows of one multi-row INSERT
//!
//! Both share the same accumulator: adds, rejects, replaces and the
//! snapshot taken by a flush are mutually exclusive, the database call runs
//! outside the lock, and at most one flush per buffer is in flight.

mod batch;
pub mod insert_buffer;
pub mod query_buffer;
mod sync;
pub mod value;

pub use batch::{AddOutcome, FlushObserver, FlushOutcome};
pub use insert_buffer::{InsertBuffer, InsertBufferBuilder};
pub use query_buffer::{QueryBuffer, QueryBufferBuilder};
pub use value::{InsertValue, TIMESTAMP_FORMAT};
