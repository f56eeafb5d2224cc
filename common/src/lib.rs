//! Key-partitioned map/reduce output engine.
//!
//! A [`MultiOutputJob`] maps raw dump lines to `(key, row)` pairs. The
//! [`Runner`] groups them by key and calls the job's reducer once per key,
//! each writing its own file, then writes the [`marker`] that tells
//! downstream stages the output root is complete.

pub mod codec;
pub mod dialect;
mod error;
pub mod filter;
mod job;
pub mod logging;
pub mod marker;
pub mod pathset;
pub mod record;
pub mod router;
pub mod runner;
pub mod spill;
pub mod writer;

pub use codec::{Codec, FIELD_SIZE_LIMIT};
pub use dialect::Dialect;
pub use error::{Error, Result};
pub use filter::RowFilter;
pub use job::{KeyValue, MultiOutputJob};
pub use logging::init_logger;
pub use record::Record;
pub use router::{sanitize, OutputRouter};
pub use runner::{FailurePolicy, JobConfig, RunOutcome, RunSummary, Runner, SPILL_BUFFER_SIZE};
pub use writer::{PartitionRegistry, PartitionWriter, WriterState};
