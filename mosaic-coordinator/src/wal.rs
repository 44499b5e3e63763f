//! Coordinator write-ahead log.
//!
//! One tab-separated text record per line:
//! `<transID>\t<decision>\t<fileName>\t<sourceMap>`. Every append is synced
//! to durable storage before the caller takes any externally observable
//! action that depends on it. Replay tolerates a torn final line, which is
//! the only damage a crash mid-append can leave.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::source_map::{SourceMap, SourceMapError};

/// The four decision points of a transaction's life, in log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// PREPARE broadcast, awaiting votes.
    Prepare,
    /// Decided to commit; the artifact is already persisted.
    Commit,
    /// Decided to abort.
    Abort,
    /// All acknowledgements collected.
    Finished,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Abort => "abort",
            Self::Finished => "finished",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "prepare" => Some(Self::Prepare),
            "commit" => Some(Self::Commit),
            "abort" => Some(Self::Abort),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub trans_id: u64,
    pub decision: Decision,
    pub file_name: String,
    pub sources: SourceMap,
}

impl LogRecord {
    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\n",
            self.trans_id,
            self.decision.as_str(),
            self.file_name,
            self.sources
        )
    }

    fn parse(line: &str) -> Result<Self, RecordParseError> {
        let bad = || RecordParseError(line.to_owned());
        let mut fields = line.splitn(4, '\t');
        let trans_id = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(bad)?;
        let decision = fields
            .next()
            .and_then(Decision::parse)
            .ok_or_else(bad)?;
        let file_name = fields.next().ok_or_else(bad)?.to_owned();
        if file_name.is_empty() {
            return Err(bad());
        }
        let sources = fields
            .next()
            .ok_or_else(bad)
            .and_then(|f| SourceMap::parse(f).map_err(|_: SourceMapError| bad()))?;
        Ok(Self {
            trans_id,
            decision,
            file_name,
            sources,
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

/// Append-only durable log, shared by every transaction worker.
pub struct CoordinatorWal {
    path: PathBuf,
    file: Mutex<File>,
}

impl CoordinatorWal {
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
    pub fn append(&self, record: &LogRecord) -> io::Result<()> {
        let line = record.to_line();
        let mut file = self.file.lock().unwrap();
        file.write_all(line.as_bytes())?;
        file.sync_all()
    }

    /// Read every intact record currently in the log at `path`.
    ///
    /// A record that does not parse is logged and skipped; a crash can only
    /// tear the final line, so anything before it is trustworthy.
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

    /// Discard every record. Called once recovery has driven every
    /// in-flight transaction to a terminal state.
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
