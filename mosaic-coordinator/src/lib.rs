//! Two-phase commit coordinator for mosaic collage transactions.
//!
//! The coordinator accepts a submission (artifact name, artifact bytes, a
//! list of `participant:file` source tuples), drives a two-phase commit
//! across the named participants, and persists the artifact iff every
//! participant votes to commit. A write-ahead log makes every decision
//! durable before it becomes externally visible, so a crashed coordinator
//! replays the log on restart and drives every in-flight transaction to a
//! terminal state before accepting new work.
//!
//! # Architecture
//!
//! - [`Coordinator`]: process-wide context (transport, WAL, live-transaction
//!   table, transaction-id counter), plus the dispatcher receive loop
//! - [`txn`]: one worker task per live transaction
//! - [`recovery`]: startup log replay
//! - [`api`]: HTTP submission and introspection surface

pub mod api;
mod coordinator;
mod recovery;
mod source_map;
mod txn;
mod wal;

pub use coordinator::{Coordinator, SubmitError};
pub use source_map::{SourceMap, SourceMapError};
pub use txn::TxnConfig;
pub use wal::{CoordinatorWal, Decision, LogRecord};
