//! Session-scoped, append-only event ledger.
//!
//! Every conversation turn records four kinds of events (user input, model
//! call, tool call, final response). Entries stay in memory until the turn
//! ends, then the whole session slice is flushed to a [`LogSink`] in one batch.

pub mod error;
pub mod logger;
pub mod sink;
pub mod types;

pub use error::LogError;
pub use logger::{EventLog, FlushOutcome};
pub use sink::{JsonFileSink, LogSink, MemorySink};
pub use types::{EventType, LogEntry, LogScope};
