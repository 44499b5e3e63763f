//! Process-wide coordinator context and the dispatcher receive loop.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use error_stack::Report;
use mosaic_core::{codec, Transport, WireMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::txn::{CommitTxn, TxnConfig, TxnError, TxnKind};
use crate::wal::CoordinatorWal;
use crate::{SourceMap, SourceMapError};

/// Depth of each transaction's inbox. Anything beyond this is treated as
/// loss, which the protocol already tolerates.
const INBOX_DEPTH: usize = 64;

/// An inbound message routed to the transaction owning its fingerprint.
pub(crate) struct Routed {
    pub from: String,
    pub msg: WireMessage,
}

/// State shared by the submission path, the dispatcher and every
/// transaction worker. Constructed once at startup and passed around
/// explicitly.
pub(crate) struct Shared<T: Transport> {
    pub transport: T,
    pub wal: CoordinatorWal,
    pub workdir: PathBuf,
    pub config: TxnConfig,
    /// Live transactions, keyed by fingerprint.
    active: Mutex<HashMap<String, mpsc::Sender<Routed>>>,
    /// Monotonic transaction-id counter; ids only correlate log records.
    next_id: AtomicU64,
}

#[derive(Debug)]
pub enum SubmitError {
    /// A transaction with this fingerprint is already in flight.
    InFlight(String),
    /// The artifact name is empty or escapes the working directory.
    BadFileName(String),
    /// A source tuple failed to parse.
    BadSources(SourceMapError),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InFlight(name) => write!(f, "transaction already in flight for {name:?}"),
            Self::BadFileName(name) => write!(f, "unusable artifact name {name:?}"),
            Self::BadSources(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Handle to the coordinator context. Cheap to clone; all clones share the
/// same state.
pub struct Coordinator<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: T, wal: CoordinatorWal, workdir: PathBuf, config: TxnConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                wal,
                workdir,
                config,
                active: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Submit a new collage commit. Returns once the transaction worker is
    /// spawned; the protocol itself runs asynchronously.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] if the fingerprint is already live, the
    /// artifact name is unusable, or a source tuple is malformed.
    pub fn start_commit(
        &self,
        file_name: String,
        content: Vec<u8>,
        sources: &[String],
    ) -> Result<(), Report<SubmitError>> {
        // no separators: the name must stay inside the working directory
        // and survive both log grammars as a single field
        if file_name.is_empty() || file_name.contains(['/', '\\', ' ', '\t', '\n']) {
            return Err(Report::new(SubmitError::BadFileName(file_name)));
        }
        let map = SourceMap::from_tuples(sources)
            .map_err(|e| Report::new(SubmitError::BadSources(e)))?;

        let inbox = self.shared.register(&file_name)?;
        info!(file = %file_name, participants = map.len(), "accepted commit submission");

        let txn = CommitTxn::new(
            Arc::clone(&self.shared),
            self.shared.allocate_id(),
            file_name.clone(),
            map,
            TxnKind::Fresh { content },
            inbox,
        );
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let outcome = txn.run().await;
            shared.retire(&file_name, outcome);
        });
        Ok(())
    }

    /// Fingerprints of the transactions currently in flight.
    #[must_use]
    pub fn active_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .shared
            .active
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        files.sort();
        files
    }

    /// The single receive loop: pulls datagrams off the substrate and hands
    /// each to the transaction owning its fingerprint. Does nothing with a
    /// message beyond decoding and reading that field.
    pub async fn dispatch(&self) {
        while let Some(inbound) = self.shared.transport.recv().await {
            let msg = match codec::decode(&inbound.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(from = %inbound.from, error = %e, "dropping undecodable datagram");
                    continue;
                }
            };
            let slot = {
                let active = self.shared.active.lock().unwrap();
                active.get(&msg.file_name).cloned()
            };
            match slot {
                Some(tx) => {
                    let routed = Routed {
                        from: inbound.from,
                        msg,
                    };
                    if let Err(e) = tx.try_send(routed) {
                        trace!(error = %e, "inbox unavailable, dropping message");
                    }
                }
                None => trace!(file = %msg.file_name, "no live transaction for fingerprint"),
            }
        }
        debug!("substrate closed, dispatcher exiting");
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }
}

impl<T: Transport> Shared<T> {
    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim a fingerprint and hand back the inbox for its worker.
    pub(crate) fn register(
        &self,
        file_name: &str,
    ) -> Result<mpsc::Receiver<Routed>, Report<SubmitError>> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(file_name) {
            return Err(Report::new(SubmitError::InFlight(file_name.to_owned())));
        }
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        active.insert(file_name.to_owned(), tx);
        Ok(rx)
    }

    /// Drop a finished transaction from the live table and surface its
    /// outcome. A WAL failure is fatal: the process exits so that restart
    /// replay restores a legal state.
    pub(crate) fn retire(&self, file_name: &str, outcome: Result<(), Report<TxnError>>) {
        self.active.lock().unwrap().remove(file_name);
        match outcome {
            Ok(()) => debug!(file = %file_name, "transaction finished"),
            Err(report) if matches!(report.current_context(), TxnError::Wal) => {
                error!(file = %file_name, ?report, "log append failed, exiting for replay");
                std::process::exit(1);
            }
            Err(report) => warn!(file = %file_name, ?report, "transaction worker failed"),
        }
    }
}
