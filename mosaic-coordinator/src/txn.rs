//! Per-transaction commit worker.
//!
//! One worker task owns each live transaction. A fresh transaction runs the
//! full protocol: PREPARE broadcast, vote collection bounded by the voting
//! window, then a durable decision and ACK collection with retransmission.
//! Recovered transactions skip straight to re-broadcasting their logged
//! decision.
//!
//! Vote and ACK bookkeeping is kept in pure, I/O-free state machines
//! ([`VoteTally`], [`AckTracker`]) so the decision rules are testable
//! without a transport.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use mosaic_core::{codec, MessageKind, Transport, WireMessage};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, trace, warn};

use crate::coordinator::{Routed, Shared};
use crate::wal::{Decision, LogRecord};
use crate::SourceMap;

/// The two protocol windows, both a few seconds by default.
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// How long to wait for votes before treating silence as VOTEABORT.
    pub vote_window: Duration,
    /// How long to wait for ACKs before re-broadcasting the decision.
    pub retransmit_window: Duration,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            vote_window: Duration::from_secs(3),
            retransmit_window: Duration::from_secs(3),
        }
    }
}

/// Tracks votes from the expected participant set.
///
/// Votes are recorded per sender, so a duplicated VOTECOMMIT datagram
/// cannot satisfy the quorum early. Senders outside the expected set and
/// non-vote messages are ignored.
#[derive(Debug)]
pub(crate) struct VoteTally {
    expected: BTreeSet<String>,
    committed: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TallyOutcome {
    Pending,
    Commit,
    Abort,
}

impl VoteTally {
    pub(crate) fn new<I: IntoIterator<Item = String>>(participants: I) -> Self {
        Self {
            expected: participants.into_iter().collect(),
            committed: BTreeSet::new(),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.committed.len() == self.expected.len()
    }

    pub(crate) fn record(&mut self, from: &str, kind: MessageKind) -> TallyOutcome {
        if !self.expected.contains(from) {
            return TallyOutcome::Pending;
        }
        match kind {
            MessageKind::VoteCommit => {
                self.committed.insert(from.to_owned());
                if self.is_complete() {
                    TallyOutcome::Commit
                } else {
                    TallyOutcome::Pending
                }
            }
            MessageKind::VoteAbort => TallyOutcome::Abort,
            _ => TallyOutcome::Pending,
        }
    }
}

/// Tracks which participants still owe an ACK for the decision.
#[derive(Debug)]
pub(crate) struct AckTracker {
    pending: BTreeSet<String>,
}

impl AckTracker {
    pub(crate) fn new<I: IntoIterator<Item = String>>(participants: I) -> Self {
        Self {
            pending: participants.into_iter().collect(),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Records an ACK. Returns false for duplicates and unknown senders,
    /// which the caller discards.
    pub(crate) fn record(&mut self, from: &str) -> bool {
        self.pending.remove(from)
    }

    pub(crate) fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }
}

#[derive(Debug)]
pub(crate) enum TxnError {
    /// The write-ahead log could not be appended; fatal to the process.
    Wal,
    /// The dispatcher hung up while the transaction still needed its inbox.
    InboxClosed,
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wal => f.write_str("write-ahead log append failed"),
            Self::InboxClosed => f.write_str("transaction inbox closed"),
        }
    }
}

impl std::error::Error for TxnError {}

/// How this transaction came to exist.
pub(crate) enum TxnKind {
    /// A fresh submission carrying the artifact bytes.
    Fresh { content: Vec<u8> },
    /// Recovered from a `commit` record: re-broadcast COMMIT_SUC.
    ResumeCommit,
    /// Recovered from a `prepare` or `abort` record: re-broadcast
    /// COMMIT_FAIL.
    ResumeAbort,
}

enum Verdict {
    Commit,
    Abort,
}

pub(crate) struct CommitTxn<T: Transport> {
    shared: Arc<Shared<T>>,
    trans_id: u64,
    file_name: String,
    sources: SourceMap,
    kind: TxnKind,
    inbox: mpsc::Receiver<Routed>,
}

impl<T: Transport> CommitTxn<T> {
    pub(crate) fn new(
        shared: Arc<Shared<T>>,
        trans_id: u64,
        file_name: String,
        sources: SourceMap,
        kind: TxnKind,
        inbox: mpsc::Receiver<Routed>,
    ) -> Self {
        Self {
            shared,
            trans_id,
            file_name,
            sources,
            kind,
            inbox,
        }
    }

    /// Drive the transaction to FINISHED.
    #[instrument(skip_all, name = "txn", fields(file = %self.file_name, id = self.trans_id))]
    pub(crate) async fn run(mut self) -> Result<(), Report<TxnError>> {
        let verdict = match &self.kind {
            TxnKind::Fresh { .. } => self.vote_phase().await?,
            TxnKind::ResumeCommit => Verdict::Commit,
            TxnKind::ResumeAbort => Verdict::Abort,
        };
        match verdict {
            Verdict::Commit => self.commit().await,
            Verdict::Abort => self.abort().await,
        }
    }

    /// Broadcast PREPARE, durably log it, then collect votes until the
    /// verdict is known or the voting window elapses.
    async fn vote_phase(&mut self) -> Result<Verdict, Report<TxnError>> {
        let TxnKind::Fresh { content } = &self.kind else {
            unreachable!("vote phase only runs for fresh transactions")
        };
        for (addr, files) in self.sources.iter() {
            let msg =
                WireMessage::prepare(self.file_name.clone(), content.clone(), files.to_vec());
            self.shared.transport.send(addr, codec::encode(&msg)).await;
        }
        self.log(Decision::Prepare)?;

        let mut tally = VoteTally::new(self.sources.participants().map(str::to_owned));
        if tally.is_complete() {
            // zero participants: nothing to wait for
            return Ok(Verdict::Commit);
        }

        let deadline = Instant::now() + self.shared.config.vote_window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.inbox.recv()).await {
                Err(_) => {
                    debug!("voting window elapsed, treating missing votes as aborts");
                    return Ok(Verdict::Abort);
                }
                Ok(None) => return Err(Report::new(TxnError::InboxClosed)),
                Ok(Some(routed)) => match tally.record(&routed.from, routed.msg.kind) {
                    TallyOutcome::Pending => trace!(from = %routed.from, "vote recorded"),
                    TallyOutcome::Commit => return Ok(Verdict::Commit),
                    TallyOutcome::Abort => {
                        debug!(from = %routed.from, "participant voted abort");
                        return Ok(Verdict::Abort);
                    }
                },
            }
        }
    }

    async fn commit(&mut self) -> Result<(), Report<TxnError>> {
        if let TxnKind::Fresh { content } = &self.kind {
            // The artifact must be durable before the commit record is, so
            // recovery never announces a commit whose artifact is missing.
            if let Err(e) = self.write_artifact(content) {
                warn!(error = %e, "artifact write failed, aborting transaction");
                return self.abort().await;
            }
            self.log(Decision::Commit)?;
        }
        self.collect_acks(MessageKind::CommitSuc).await
    }

    async fn abort(&mut self) -> Result<(), Report<TxnError>> {
        self.log(Decision::Abort)?;
        self.collect_acks(MessageKind::CommitFail).await
    }

    fn write_artifact(&self, content: &[u8]) -> std::io::Result<()> {
        let path = self.shared.workdir.join(&self.file_name);
        let mut file = File::create(path)?;
        file.write_all(content)?;
        file.sync_all()
    }

    /// Broadcast the decision, then drain the inbox until every participant
    /// has acknowledged, re-broadcasting to the laggards whenever the
    /// retransmission window passes without progress.
    async fn collect_acks(&mut self, decision: MessageKind) -> Result<(), Report<TxnError>> {
        let mut acks = AckTracker::new(self.sources.participants().map(str::to_owned));
        self.broadcast(decision).await;

        let mut deadline = Instant::now() + self.shared.config.retransmit_window;
        while !acks.is_done() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.inbox.recv()).await {
                Err(_) => {
                    debug!(
                        decision = decision.as_str(),
                        pending = acks.len(),
                        "retransmitting decision"
                    );
                    for (addr, files) in self.sources.iter() {
                        if acks.pending().any(|p| p == addr) {
                            let msg = WireMessage::decision(
                                decision,
                                self.file_name.clone(),
                                files.to_vec(),
                            );
                            self.shared.transport.send(addr, codec::encode(&msg)).await;
                        }
                    }
                    deadline = Instant::now() + self.shared.config.retransmit_window;
                }
                Ok(None) => return Err(Report::new(TxnError::InboxClosed)),
                Ok(Some(routed)) => {
                    if routed.msg.kind == MessageKind::Ack && acks.record(&routed.from) {
                        trace!(from = %routed.from, "ack");
                    }
                    // duplicate ACKs and straggler votes are discarded
                }
            }
        }
        self.log(Decision::Finished)
    }

    async fn broadcast(&self, decision: MessageKind) {
        for (addr, files) in self.sources.iter() {
            let msg = WireMessage::decision(decision, self.file_name.clone(), files.to_vec());
            self.shared.transport.send(addr, codec::encode(&msg)).await;
        }
    }

    fn log(&self, decision: Decision) -> Result<(), Report<TxnError>> {
        self.shared
            .wal
            .append(&LogRecord {
                trans_id: self.trans_id,
                decision,
                file_name: self.file_name.clone(),
                sources: self.sources.clone(),
            })
            .change_context(TxnError::Wal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(addrs: &[&str]) -> VoteTally {
        VoteTally::new(addrs.iter().map(|s| (*s).to_owned()))
    }

    #[test]
    fn all_commit_votes_reach_commit() {
        let mut t = tally(&["A", "B"]);
        assert_eq!(t.record("A", MessageKind::VoteCommit), TallyOutcome::Pending);
        assert_eq!(t.record("B", MessageKind::VoteCommit), TallyOutcome::Commit);
    }

    #[test]
    fn any_abort_vote_aborts() {
        let mut t = tally(&["A", "B"]);
        assert_eq!(t.record("A", MessageKind::VoteCommit), TallyOutcome::Pending);
        assert_eq!(t.record("B", MessageKind::VoteAbort), TallyOutcome::Abort);
    }

    #[test]
    fn duplicate_commit_vote_does_not_fake_quorum() {
        let mut t = tally(&["A", "B"]);
        assert_eq!(t.record("A", MessageKind::VoteCommit), TallyOutcome::Pending);
        assert_eq!(t.record("A", MessageKind::VoteCommit), TallyOutcome::Pending);
        assert!(!t.is_complete());
    }

    #[test]
    fn unknown_sender_is_ignored() {
        let mut t = tally(&["A"]);
        assert_eq!(t.record("Z", MessageKind::VoteAbort), TallyOutcome::Pending);
        assert_eq!(t.record("Z", MessageKind::VoteCommit), TallyOutcome::Pending);
        assert!(!t.is_complete());
    }

    #[test]
    fn non_vote_kinds_are_ignored() {
        let mut t = tally(&["A"]);
        assert_eq!(t.record("A", MessageKind::Ack), TallyOutcome::Pending);
        assert!(!t.is_complete());
    }

    #[test]
    fn empty_tally_is_complete() {
        assert!(tally(&[]).is_complete());
    }

    #[test]
    fn acks_complete_once_each() {
        let mut a = AckTracker::new(["A".to_owned(), "B".to_owned()]);
        assert!(a.record("A"));
        assert!(!a.record("A"), "duplicate ACK must be discarded");
        assert!(!a.record("Z"), "unknown sender must be discarded");
        assert!(!a.is_done());
        assert!(a.record("B"));
        assert!(a.is_done());
    }

    #[test]
    fn pending_lists_laggards() {
        let mut a = AckTracker::new(["A".to_owned(), "B".to_owned()]);
        a.record("A");
        assert_eq!(a.pending().collect::<Vec<_>>(), ["B"]);
    }
}
