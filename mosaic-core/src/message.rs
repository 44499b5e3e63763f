//! The messages exchanged between the coordinator and participants.

use serde::{Deserialize, Serialize};

/// Discriminant of the single wire record.
///
/// The coordinator sends `Prepare`, `CommitSuc` and `CommitFail`;
/// participants answer with `VoteCommit`, `VoteAbort` and `Ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Prepare,
    VoteCommit,
    VoteAbort,
    CommitSuc,
    CommitFail,
    Ack,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "PREPARE",
            Self::VoteCommit => "VOTECOMMIT",
            Self::VoteAbort => "VOTEABORT",
            Self::CommitSuc => "COMMIT_SUC",
            Self::CommitFail => "COMMIT_FAIL",
            Self::Ack => "ACK",
        }
    }
}

/// The single record type crossing the wire.
///
/// `file_name` is the transaction fingerprint: it names both the artifact
/// being assembled on the coordinator and the transaction itself, on every
/// node. `content` is opaque payload and only populated in `Prepare`.
/// `sources` is the slice of source filenames relevant to the receiver,
/// in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub file_name: String,
    pub content: Vec<u8>,
    pub sources: Vec<String>,
}

impl WireMessage {
    #[must_use]
    pub fn prepare(file_name: String, content: Vec<u8>, sources: Vec<String>) -> Self {
        Self {
            kind: MessageKind::Prepare,
            file_name,
            content,
            sources,
        }
    }

    /// A decision broadcast for one participant's slice of the sources.
    /// Decisions never carry content.
    #[must_use]
    pub fn decision(kind: MessageKind, file_name: String, sources: Vec<String>) -> Self {
        Self {
            kind,
            file_name,
            content: Vec::new(),
            sources,
        }
    }

    /// A participant's reply to `self`, echoing fingerprint and sources.
    #[must_use]
    pub fn reply(&self, kind: MessageKind) -> Self {
        Self {
            kind,
            file_name: self.file_name.clone(),
            content: Vec::new(),
            sources: self.sources.clone(),
        }
    }
}
