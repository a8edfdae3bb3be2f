//! Durable record store: single SQLite file, single writer, many readers.
//!
//! - [`store::LogStore`] is the write handle. Exactly one exists per service,
//!   shared by the ingest pipeline and the retention task behind a mutex.
//! - [`store::ReadStore`] is a read-only connection to the same file; the
//!   query API opens one per concurrent query and runs it on a blocking
//!   thread, using [`rusqlite::InterruptHandle`] for cancellation.

pub mod analysis;
pub mod retention;
pub mod store;

pub use store::{
    LogStore, ReadStore, ResolvedQuery, ResolvedSearch, StorageError, TextQuery, SCHEMA_VERSION,
};
