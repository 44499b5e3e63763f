//! Participant node for mosaic collage transactions.
//!
//! A participant holds candidate source files in its working directory and
//! answers the coordinator's two-phase commit traffic: it validates and
//! votes on PREPARE, applies COMMIT_SUC / COMMIT_FAIL, and acknowledges
//! every decision idempotently, since the coordinator retransmits until it
//! hears the ACK. A local write-ahead log makes its promises survive a
//! crash.

mod node;
mod recovery;
mod wal;

pub use node::{Approver, Participant, ParticipantError, Policy};
pub use wal::{Decision, LogRecord, ParticipantWal};
