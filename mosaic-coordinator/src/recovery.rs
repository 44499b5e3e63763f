//! Startup log replay.
//!
//! The log is the sole truth after a crash. Scanning it yields, per
//! transaction id, the highest phase reached: anything that logged `commit`
//! is re-committed, anything stuck at `prepare` (or already `abort`) is
//! aborted, and `finished` entries need nothing. Uncommitted PREPAREs
//! become unilateral aborts: participants that voted to commit are told to
//! abort, participants that never heard the PREPARE ignore it, and
//! participants that already aborted re-ACK idempotently.

use std::collections::BTreeMap;
use std::fmt;

use error_stack::{Report, ResultExt};
use mosaic_core::Transport;
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::txn::{CommitTxn, TxnKind};
use crate::wal::{CoordinatorWal, Decision, LogRecord};
use crate::SourceMap;

#[derive(Debug)]
pub enum RecoveryError {
    /// The log file could not be read or truncated.
    Log,
    /// A resumed transaction failed before reaching FINISHED.
    Resume,
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log => f.write_str("write-ahead log replay failed"),
            Self::Resume => f.write_str("resumed transaction failed"),
        }
    }
}

impl std::error::Error for RecoveryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecoveredTxn {
    pub file_name: String,
    pub sources: SourceMap,
}

/// What replay owes the cluster: every entry re-broadcasts its decision
/// until acknowledged.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RecoveryPlan {
    pub to_commit: Vec<RecoveredTxn>,
    pub to_abort: Vec<RecoveredTxn>,
}

/// Fold the log into a recovery plan, applying records in file order.
pub(crate) fn scan(records: &[LogRecord]) -> RecoveryPlan {
    let mut to_abort: BTreeMap<u64, RecoveredTxn> = BTreeMap::new();
    let mut to_commit: BTreeMap<u64, RecoveredTxn> = BTreeMap::new();
    for record in records {
        let recovered = || RecoveredTxn {
            file_name: record.file_name.clone(),
            sources: record.sources.clone(),
        };
        match record.decision {
            Decision::Prepare => {
                to_abort.insert(record.trans_id, recovered());
            }
            Decision::Commit => {
                to_abort.remove(&record.trans_id);
                to_commit.insert(record.trans_id, recovered());
            }
            Decision::Abort => {
                to_abort.entry(record.trans_id).or_insert_with(recovered);
            }
            Decision::Finished => {
                to_abort.remove(&record.trans_id);
                to_commit.remove(&record.trans_id);
            }
        }
    }
    RecoveryPlan {
        to_commit: to_commit.into_values().collect(),
        to_abort: to_abort.into_values().collect(),
    }
}

impl<T: Transport> Coordinator<T> {
    /// Replay the log and drive every unfinished transaction to FINISHED,
    /// commits first, one at a time; then truncate the log. Run this before
    /// accepting submissions. The dispatcher must already be pumping the
    /// substrate so that participant ACKs reach the resumed workers.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError`] if the log cannot be read or truncated, or
    /// a resumed transaction fails.
    pub async fn recover(&self) -> Result<(), Report<RecoveryError>> {
        let records = CoordinatorWal::replay(self.shared().wal.path())
            .change_context(RecoveryError::Log)?;
        let plan = scan(&records);
        if !plan.to_commit.is_empty() || !plan.to_abort.is_empty() {
            info!(
                commits = plan.to_commit.len(),
                aborts = plan.to_abort.len(),
                "replaying unfinished transactions"
            );
        }

        for txn in plan.to_commit {
            self.resume(txn, TxnKind::ResumeCommit).await?;
        }
        for txn in plan.to_abort {
            self.resume(txn, TxnKind::ResumeAbort).await?;
        }

        self.shared()
            .wal
            .truncate()
            .change_context(RecoveryError::Log)?;
        debug!("recovery complete, log truncated");
        Ok(())
    }

    async fn resume(
        &self,
        txn: RecoveredTxn,
        kind: TxnKind,
    ) -> Result<(), Report<RecoveryError>> {
        let shared = self.shared();
        let inbox = shared
            .register(&txn.file_name)
            .change_context(RecoveryError::Resume)?;
        let worker = CommitTxn::new(
            std::sync::Arc::clone(shared),
            shared.allocate_id(),
            txn.file_name.clone(),
            txn.sources,
            kind,
            inbox,
        );
        let outcome = worker.run().await;
        shared.retire(&txn.file_name, outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(trans_id: u64, decision: Decision, file: &str) -> LogRecord {
        LogRecord {
            trans_id,
            decision,
            file_name: file.to_owned(),
            sources: SourceMap::from_tuples(&[format!("A:{file}.src")]).unwrap(),
        }
    }

    #[test]
    fn prepare_without_terminal_record_aborts() {
        let plan = scan(&[record(1, Decision::Prepare, "x")]);
        assert!(plan.to_commit.is_empty());
        assert_eq!(plan.to_abort.len(), 1);
        assert_eq!(plan.to_abort[0].file_name, "x");
    }

    #[test]
    fn commit_moves_out_of_abort() {
        let plan = scan(&[
            record(1, Decision::Prepare, "x"),
            record(1, Decision::Commit, "x"),
        ]);
        assert_eq!(plan.to_commit.len(), 1);
        assert!(plan.to_abort.is_empty());
    }

    #[test]
    fn finished_clears_everything() {
        let plan = scan(&[
            record(1, Decision::Prepare, "x"),
            record(1, Decision::Commit, "x"),
            record(1, Decision::Finished, "x"),
        ]);
        assert_eq!(plan, RecoveryPlan::default());
    }

    #[test]
    fn abort_record_is_not_duplicated() {
        let plan = scan(&[
            record(1, Decision::Prepare, "x"),
            record(1, Decision::Abort, "x"),
        ]);
        assert_eq!(plan.to_abort.len(), 1);
    }

    #[test]
    fn abort_without_prepare_still_aborts() {
        // a crash can tear the earlier prepare line off the log tail only,
        // but an abort-first log must still resolve to an abort
        let plan = scan(&[record(1, Decision::Abort, "x")]);
        assert_eq!(plan.to_abort.len(), 1);
    }

    #[test]
    fn independent_transactions_resolve_independently() {
        let plan = scan(&[
            record(1, Decision::Prepare, "x"),
            record(2, Decision::Prepare, "y"),
            record(2, Decision::Commit, "y"),
            record(3, Decision::Prepare, "z"),
            record(3, Decision::Abort, "z"),
            record(3, Decision::Finished, "z"),
        ]);
        assert_eq!(plan.to_abort.len(), 1);
        assert_eq!(plan.to_abort[0].file_name, "x");
        assert_eq!(plan.to_commit.len(), 1);
        assert_eq!(plan.to_commit[0].file_name, "y");
    }

    #[test]
    fn scanning_twice_is_identical() {
        let records = [
            record(1, Decision::Prepare, "x"),
            record(2, Decision::Prepare, "y"),
            record(2, Decision::Commit, "y"),
        ];
        assert_eq!(scan(&records), scan(&records));
    }
}
