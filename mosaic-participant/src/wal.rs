//! Participant write-ahead log.
//!
//! One space-separated text record per line:
//! `<decision> <fileName> <src1,src2,...>`. Same durability contract as the
//! coordinator log: appends sync before any dependent externally visible
//! action, and replay tolerates a torn final line.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

/// A participant's per-transaction decision points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Voted to commit; the sources are locked.
    Agree,
    /// Voted to abort.
    Reject,
    /// Learned the commit decision; deletions follow.
    Commit,
    /// Learned the abort decision; lock releases follow.
    Abort,
    /// Decision applied and acknowledged.
    Finish,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agree => "Agree",
            Self::Reject => "Reject",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Finish => "Finish",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "Agree" => Some(Self::Agree),
            "Reject" => Some(Self::Reject),
            "COMMIT" => Some(Self::Commit),
            "ABORT" => Some(Self::Abort),
            "Finish" => Some(Self::Finish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub decision: Decision,
    pub file_name: String,
    pub sources: Vec<String>,
}

impl LogRecord {
    fn to_line(&self) -> String {
        format!(
            "{} {} {}\n",
            self.decision.as_str(),
            self.file_name,
            self.sources.join(",")
        )
    }

    fn parse(line: &str) -> Result<Self, RecordParseError> {
        let bad = || RecordParseError(line.to_owned());
        let mut fields = line.splitn(3, ' ');
        let decision = fields
            .next()
            .and_then(Decision::parse)
            .ok_or_else(bad)?;
        let file_name = fields.next().ok_or_else(bad)?.to_owned();
        let sources = fields.next().ok_or_else(bad)?;
        if file_name.is_empty() || sources.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            decision,
            file_name,
            sources: sources.split(',').map(str::to_owned).collect(),
        })
    }
}

#[derive(Debug)]
pub struct RecordParseError(String);

impl fmt::Display for RecordParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed log record: {:?}", self.0)
    }
}

impl std::error::Error for RecordParseError {}

/// Append-only durable log for one participant.
pub struct ParticipantWal {
    path: PathBuf,
    file: Mutex<File>,
}

impl ParticipantWal {
    /// Open (creating if absent) the log for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails; callers treat this as
    /// fatal to the process.
    pub fn append(&self, decision: Decision, file_name: &str, sources: &[String]) -> io::Result<()> {
        let record = LogRecord {
            decision,
            file_name: file_name.to_owned(),
            sources: sources.to_vec(),
        };
        let line = record.to_line();
        let mut file = self.file.lock().unwrap();
        file.write_all(line.as_bytes())?;
        file.sync_all()
    }

    /// Read every intact record currently in the log at `path`, skipping a
    /// torn final line.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read. A missing file reads as
    /// an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<LogRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            match LogRecord::parse(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping torn log record"),
            }
        }
        Ok(records)
    }

    /// Discard every record once recovery has re-applied them.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation fails.
    pub fn truncate(&self) -> io::Result<()> {
        let file = self.file.lock().unwrap();
        file.set_len(0)?;
        file.sync_all()
    }
}
