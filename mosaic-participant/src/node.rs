//! The participant state machine.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use error_stack::{Report, ResultExt};
use mosaic_core::{codec, MessageKind, Transport, WireMessage};
use tracing::{debug, instrument, trace, warn};

use crate::wal::{Decision, ParticipantWal};

/// The user-approval oracle consulted before voting to commit.
pub trait Approver: Send + Sync + 'static {
    fn approve(&self, content: &[u8], sources: &[String]) -> impl Future<Output = bool> + Send;
}

impl<T: Approver> Approver for Arc<T> {
    async fn approve(&self, content: &[u8], sources: &[String]) -> bool {
        T::approve(self, content, sources).await
    }
}

/// Fixed approval policy for the participant binary; tests substitute
/// scripted oracles.
#[derive(Debug, Clone, Copy)]
pub enum Policy {
    ApproveAll,
    RejectAll,
}

impl Approver for Policy {
    async fn approve(&self, _content: &[u8], _sources: &[String]) -> bool {
        matches!(self, Self::ApproveAll)
    }
}

#[derive(Debug)]
pub enum ParticipantError {
    /// The write-ahead log could not be appended; fatal to the process.
    Wal,
}

impl fmt::Display for ParticipantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wal => f.write_str("write-ahead log append failed"),
        }
    }
}

impl std::error::Error for ParticipantError {}

/// One participant node: its lock set, log and approval oracle.
///
/// Messages are handled strictly in arrival order by [`Participant::run`];
/// the interior mutexes only exist so the handler can take `&self`.
pub struct Participant<T: Transport, A: Approver> {
    id: String,
    transport: T,
    wal: ParticipantWal,
    workdir: PathBuf,
    approver: A,
    /// Files promised to some live transaction.
    locks: Mutex<HashSet<String>>,
    /// Fingerprints already driven to `Finish` in this process lifetime,
    /// so a retransmitted decision is re-ACKed without re-applying.
    finished: Mutex<HashSet<String>>,
}

impl<T: Transport, A: Approver> Participant<T, A> {
    pub fn new(id: String, transport: T, wal: ParticipantWal, workdir: PathBuf, approver: A) -> Self {
        Self {
            id,
            transport,
            wal,
            workdir,
            approver,
            locks: Mutex::new(HashSet::new()),
            finished: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle messages in arrival order until the substrate shuts down.
    ///
    /// # Errors
    ///
    /// Returns an error only for log-append failures, which are fatal.
    #[instrument(skip_all, name = "participant", fields(id = %self.id))]
    pub async fn run(&self) -> Result<(), Report<ParticipantError>> {
        while let Some(inbound) = self.transport.recv().await {
            let msg = match codec::decode(&inbound.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(from = %inbound.from, error = %e, "dropping undecodable datagram");
                    continue;
                }
            };
            self.handle(&inbound.from, msg).await?;
        }
        debug!("substrate closed, participant exiting");
        Ok(())
    }

    /// Apply one inbound message.
    ///
    /// # Errors
    ///
    /// Returns an error only for log-append failures.
    pub async fn handle(&self, from: &str, msg: WireMessage) -> Result<(), Report<ParticipantError>> {
        match msg.kind {
            MessageKind::Prepare => self.handle_prepare(from, &msg).await,
            MessageKind::CommitSuc => self.handle_decision(from, &msg, true).await,
            MessageKind::CommitFail => self.handle_decision(from, &msg, false).await,
            _ => {
                trace!(kind = msg.kind.as_str(), "ignoring unexpected message");
                Ok(())
            }
        }
    }

    async fn handle_prepare(
        &self,
        from: &str,
        msg: &WireMessage,
    ) -> Result<(), Report<ParticipantError>> {
        // A missing file or a file already promised elsewhere vetoes the
        // transaction before the oracle is consulted.
        let conflict = {
            let locks = self.locks.lock().unwrap();
            msg.sources
                .iter()
                .find(|s| locks.contains(*s) || !self.workdir.join(s).is_file())
                .cloned()
        };
        if let Some(source) = conflict {
            debug!(file = %msg.file_name, %source, "voting abort: missing or locked source");
            self.reply(from, msg, MessageKind::VoteAbort).await;
            return self.log(Decision::Reject, msg);
        }

        if self.approver.approve(&msg.content, &msg.sources).await {
            {
                let mut locks = self.locks.lock().unwrap();
                locks.extend(msg.sources.iter().cloned());
            }
            debug!(file = %msg.file_name, "voting commit, sources locked");
            self.reply(from, msg, MessageKind::VoteCommit).await;
            self.log(Decision::Agree, msg)
        } else {
            debug!(file = %msg.file_name, "user rejected, voting abort");
            self.reply(from, msg, MessageKind::VoteAbort).await;
            self.log(Decision::Reject, msg)
        }
    }

    async fn handle_decision(
        &self,
        from: &str,
        msg: &WireMessage,
        commit: bool,
    ) -> Result<(), Report<ParticipantError>> {
        if self.finished.lock().unwrap().contains(&msg.file_name) {
            // the coordinator lost our ACK; nothing left to apply
            trace!(file = %msg.file_name, "re-acknowledging finished transaction");
            self.reply(from, msg, MessageKind::Ack).await;
            return Ok(());
        }

        if commit {
            self.log(Decision::Commit, msg)?;
            self.apply_commit(&msg.sources);
        } else {
            self.log(Decision::Abort, msg)?;
            self.release(&msg.sources);
        }
        self.reply(from, msg, MessageKind::Ack).await;
        self.log(Decision::Finish, msg)?;
        self.finished.lock().unwrap().insert(msg.file_name.clone());
        debug!(file = %msg.file_name, commit, "decision applied and acknowledged");
        Ok(())
    }

    /// Delete consumed sources and release their locks. Deletions are
    /// best-effort and idempotent: a retransmitted commit finds them gone.
    pub(crate) fn apply_commit(&self, sources: &[String]) {
        for source in sources {
            match fs::remove_file(self.workdir.join(source)) {
                Ok(()) => trace!(%source, "deleted"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(%source, error = %e, "tolerating failed delete"),
            }
        }
        self.release(sources);
    }

    pub(crate) fn release(&self, sources: &[String]) {
        let mut locks = self.locks.lock().unwrap();
        for source in sources {
            locks.remove(source);
        }
    }

    pub(crate) fn restore_locks(&self, sources: &[String]) {
        let mut locks = self.locks.lock().unwrap();
        locks.extend(sources.iter().cloned());
    }

    pub(crate) fn mark_finished(&self, file_name: &str) {
        self.finished.lock().unwrap().insert(file_name.to_owned());
    }

    pub(crate) fn wal(&self) -> &ParticipantWal {
        &self.wal
    }

    async fn reply(&self, to: &str, msg: &WireMessage, kind: MessageKind) {
        self.transport
            .send(to, codec::encode(&msg.reply(kind)))
            .await;
    }

    fn log(&self, decision: Decision, msg: &WireMessage) -> Result<(), Report<ParticipantError>> {
        self.wal
            .append(decision, &msg.file_name, &msg.sources)
            .change_context(ParticipantError::Wal)
    }
}
