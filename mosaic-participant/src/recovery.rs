//! Participant startup log replay.
//!
//! The last record for each fingerprint decides what restart owes it:
//! `Agree` means the promise is still open, so the locks come back and the
//! coordinator's retransmitted decision resolves it; `COMMIT` and `ABORT`
//! re-apply their effects (idempotently) and close with `Finish`; `Finish`
//! and `Reject` owe nothing.

use std::collections::BTreeMap;

use error_stack::{Report, ResultExt};
use mosaic_core::Transport;
use tracing::{debug, info};

use crate::node::{Approver, Participant, ParticipantError};
use crate::wal::{Decision, LogRecord, ParticipantWal};

/// The state a fingerprint was left in, per its final log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Agreed(Vec<String>),
    Committed(Vec<String>),
    Aborted(Vec<String>),
}

/// Fold the log into the last-known outcome per fingerprint.
pub(crate) fn scan(records: &[LogRecord]) -> BTreeMap<String, Outcome> {
    let mut outcomes = BTreeMap::new();
    for record in records {
        let sources = record.sources.clone();
        match record.decision {
            Decision::Agree => {
                outcomes.insert(record.file_name.clone(), Outcome::Agreed(sources));
            }
            Decision::Commit => {
                outcomes.insert(record.file_name.clone(), Outcome::Committed(sources));
            }
            Decision::Abort => {
                outcomes.insert(record.file_name.clone(), Outcome::Aborted(sources));
            }
            Decision::Finish => {
                outcomes.remove(&record.file_name);
            }
            Decision::Reject => {}
        }
    }
    outcomes
}

impl<T: Transport, A: Approver> Participant<T, A> {
    /// Replay the log, re-apply what it owes, then truncate. Run before the
    /// receive loop starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read, appended or truncated.
    pub fn recover(&self) -> Result<(), Report<ParticipantError>> {
        let records =
            ParticipantWal::replay(self.wal().path()).change_context(ParticipantError::Wal)?;
        let outcomes = scan(&records);
        if !outcomes.is_empty() {
            info!(count = outcomes.len(), "replaying unfinished transactions");
        }

        for (file_name, outcome) in outcomes {
            match outcome {
                Outcome::Agreed(sources) => {
                    debug!(file = %file_name, "restoring locks, awaiting retransmitted decision");
                    self.restore_locks(&sources);
                }
                Outcome::Committed(sources) => {
                    debug!(file = %file_name, "re-applying commit");
                    self.apply_commit(&sources);
                    self.wal()
                        .append(Decision::Finish, &file_name, &sources)
                        .change_context(ParticipantError::Wal)?;
                    self.mark_finished(&file_name);
                }
                Outcome::Aborted(sources) => {
                    debug!(file = %file_name, "re-applying abort");
                    self.release(&sources);
                    self.wal()
                        .append(Decision::Finish, &file_name, &sources)
                        .change_context(ParticipantError::Wal)?;
                    self.mark_finished(&file_name);
                }
            }
        }

        self.wal()
            .truncate()
            .change_context(ParticipantError::Wal)?;
        debug!("recovery complete, log truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(decision: Decision, file: &str, sources: &[&str]) -> LogRecord {
        LogRecord {
            decision,
            file_name: file.to_owned(),
            sources: sources.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn agree_without_terminal_record_stays_open() {
        let outcomes = scan(&[record(Decision::Agree, "x", &["a1", "a2"])]);
        assert_eq!(
            outcomes.get("x"),
            Some(&Outcome::Agreed(vec!["a1".to_owned(), "a2".to_owned()]))
        );
    }

    #[test]
    fn commit_supersedes_agree() {
        let outcomes = scan(&[
            record(Decision::Agree, "x", &["a1"]),
            record(Decision::Commit, "x", &["a1"]),
        ]);
        assert!(matches!(outcomes.get("x"), Some(Outcome::Committed(_))));
    }

    #[test]
    fn finish_closes_the_fingerprint() {
        let outcomes = scan(&[
            record(Decision::Agree, "x", &["a1"]),
            record(Decision::Commit, "x", &["a1"]),
            record(Decision::Finish, "x", &["a1"]),
        ]);
        assert!(outcomes.is_empty());
    }

    #[test]
    fn reject_owes_nothing() {
        let outcomes = scan(&[record(Decision::Reject, "x", &["a1"])]);
        assert!(outcomes.is_empty());
    }

    #[test]
    fn abort_supersedes_agree() {
        let outcomes = scan(&[
            record(Decision::Agree, "x", &["a1"]),
            record(Decision::Abort, "x", &["a1"]),
        ]);
        assert!(matches!(outcomes.get("x"), Some(Outcome::Aborted(_))));
    }

    #[test]
    fn fingerprints_resolve_independently() {
        let outcomes = scan(&[
            record(Decision::Agree, "x", &["a1"]),
            record(Decision::Agree, "y", &["b1"]),
            record(Decision::Commit, "y", &["b1"]),
            record(Decision::Finish, "y", &["b1"]),
        ]);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes.get("x"), Some(Outcome::Agreed(_))));
    }
}
