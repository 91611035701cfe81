//! Ingest pipeline between the fetch workers and the database
//!
//! Every partition pushes normalized records into one bounded queue; a single
//! writer drains it in batches. The queue carries an explicit end-of-stream
//! marker so "an empty page" and "no more pages" can never be confused.

mod queue;
mod writer;

pub use queue::{IngestQueue, IngestReceiver, IngestSender, QueueItem};
pub use writer::{spawn_writer, BatchWriter, WriterReport};
