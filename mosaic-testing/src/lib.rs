//! Deterministic test substrate for the mosaic commit system.
//!
//! [`SimNet`] is an in-memory datagram router with seeded, per-send loss
//! and duplication rolls plus targeted drop schedules, so the lost-message
//! paths of the protocol can be exercised deterministically. The crate also
//! provides a scripted approval oracle and small harness helpers shared by
//! the integration suites in `tests/`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mosaic_core::{Inbound, Transport};
use mosaic_participant::Approver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

/// Loss profile for a [`SimNet`]. The seed makes every run identical.
#[derive(Debug, Clone)]
pub struct SimNetConfig {
    pub drop_rate: f64,
    pub dup_rate: f64,
    pub seed: u64,
}

impl Default for SimNetConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            dup_rate: 0.0,
            seed: 0,
        }
    }
}

struct ScheduledDrop {
    from: String,
    to: String,
    skip: u32,
    drops: u32,
}

struct Inner {
    endpoints: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    rng: StdRng,
    config: SimNetConfig,
    scheduled: Vec<ScheduledDrop>,
    partitioned: HashSet<String>,
}

/// An in-memory datagram router addressed by logical name.
#[derive(Clone)]
pub struct SimNet {
    inner: Arc<Mutex<Inner>>,
}

impl SimNet {
    #[must_use]
    pub fn new(config: SimNetConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                endpoints: HashMap::new(),
                rng: StdRng::seed_from_u64(config.seed),
                config,
                scheduled: Vec::new(),
                partitioned: HashSet::new(),
            })),
        }
    }

    /// Register (or re-register, e.g. after a simulated restart) the
    /// endpoint for `name`. Re-registering drops the old endpoint's inbox.
    #[must_use]
    pub fn endpoint(&self, name: &str) -> SimEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .insert(name.to_owned(), tx);
        SimEndpoint {
            name: name.to_owned(),
            inner: Arc::clone(&self.inner),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Schedule a targeted drop: after letting `skip` matching datagrams
    /// through, swallow the next `drops` datagrams from `from` to `to`.
    pub fn drop_matching(&self, from: &str, to: &str, skip: u32, drops: u32) {
        self.inner.lock().unwrap().scheduled.push(ScheduledDrop {
            from: from.to_owned(),
            to: to.to_owned(),
            skip,
            drops,
        });
    }

    /// Cut `name` off from the network entirely (both directions).
    pub fn partition(&self, name: &str) {
        self.inner.lock().unwrap().partitioned.insert(name.to_owned());
    }

    pub fn heal(&self, name: &str) {
        self.inner.lock().unwrap().partitioned.remove(name);
    }
}

/// One node's handle on the [`SimNet`].
pub struct SimEndpoint {
    name: String,
    inner: Arc<Mutex<Inner>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl Transport for SimEndpoint {
    async fn send(&self, to: &str, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();

        if inner.partitioned.contains(&self.name) || inner.partitioned.contains(to) {
            return;
        }

        // targeted schedules trump the random rolls
        for sched in &mut inner.scheduled {
            if sched.from == self.name && sched.to == to && sched.drops > 0 {
                if sched.skip > 0 {
                    sched.skip -= 1;
                    break;
                }
                sched.drops -= 1;
                return;
            }
        }

        let (drop_rate, dup_rate) = (inner.config.drop_rate, inner.config.dup_rate);
        if drop_rate > 0.0 && inner.rng.random_bool(drop_rate) {
            return;
        }
        let copies = if dup_rate > 0.0 && inner.rng.random_bool(dup_rate) {
            2
        } else {
            1
        };

        if let Some(tx) = inner.endpoints.get(to) {
            for _ in 0..copies {
                let _ = tx.send(Inbound {
                    from: self.name.clone(),
                    payload: payload.clone(),
                });
            }
        }
    }

    async fn recv(&self) -> Option<Inbound> {
        self.rx.lock().await.recv().await
    }
}

/// Approval oracle with a scripted verdict queue; falls back to `default`
/// once the script is exhausted. Records the sources of every consultation
/// so tests can assert on PREPARE grouping.
pub struct ScriptedApprover {
    verdicts: Mutex<VecDeque<bool>>,
    default: bool,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedApprover {
    #[must_use]
    pub fn approving() -> Self {
        Self::scripted([], true)
    }

    #[must_use]
    pub fn rejecting() -> Self {
        Self::scripted([], false)
    }

    #[must_use]
    pub fn scripted(verdicts: impl IntoIterator<Item = bool>, default: bool) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into_iter().collect()),
            default,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The `sources` argument of every consultation so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

// Tests hold one clone for inspection and hand the other to the node.
impl Approver for ScriptedApprover {
    async fn approve(&self, _content: &[u8], sources: &[String]) -> bool {
        self.calls.lock().unwrap().push(sources.to_vec());
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default)
    }
}

/// Helpers for wiring a full cluster over a [`SimNet`].
pub mod cluster {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use mosaic_coordinator::{Coordinator, CoordinatorWal, TxnConfig};
    use mosaic_participant::{Approver, Participant, ParticipantWal};
    use tokio::task::JoinHandle;

    use crate::{SimEndpoint, SimNet};

    /// The coordinator's logical address on the sim net.
    pub const COORDINATOR: &str = "C";

    /// Windows short enough to keep timeout-path tests snappy.
    #[must_use]
    pub fn fast_config() -> TxnConfig {
        TxnConfig {
            vote_window: Duration::from_millis(400),
            retransmit_window: Duration::from_millis(250),
        }
    }

    /// Coordinator over the sim net with its dispatcher already pumping.
    /// The log lives at `<dir>/log`, artifacts land in `dir`.
    #[must_use]
    pub fn start_coordinator(
        net: &SimNet,
        dir: &Path,
        config: TxnConfig,
    ) -> Coordinator<SimEndpoint> {
        let wal = CoordinatorWal::open(dir.join("log")).unwrap();
        let coordinator = Coordinator::new(net.endpoint(COORDINATOR), wal, dir.to_owned(), config);
        let dispatcher = coordinator.clone();
        tokio::spawn(async move { dispatcher.dispatch().await });
        coordinator
    }

    /// Participant `id` over the sim net, recovered from any existing log
    /// and with its receive loop already running.
    pub fn start_participant<A: Approver>(
        net: &SimNet,
        id: &str,
        dir: &Path,
        approver: A,
    ) -> (Arc<Participant<SimEndpoint, A>>, JoinHandle<()>) {
        let wal = ParticipantWal::open(dir.join(format!("log_{id}.txt"))).unwrap();
        let participant = Arc::new(Participant::new(
            id.to_owned(),
            net.endpoint(id),
            wal,
            dir.to_owned(),
            approver,
        ));
        participant.recover().unwrap();
        let node = Arc::clone(&participant);
        let handle = tokio::spawn(async move {
            let _ = node.run().await;
        });
        (participant, handle)
    }
}

/// Create each named file with a little content under `dir`.
///
/// # Panics
///
/// Panics on I/O failure; tests treat that as a harness bug.
pub fn seed_files(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), format!("contents of {name}")).unwrap();
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_name() {
        let net = SimNet::new(SimNetConfig::default());
        let a = net.endpoint("A");
        let b = net.endpoint("B");
        a.send("B", vec![1, 2, 3]).await;
        let got = b.recv().await.unwrap();
        assert_eq!(got.from, "A");
        assert_eq!(got.payload, [1, 2, 3]);
    }

    #[tokio::test]
    async fn unknown_destination_is_dropped() {
        let net = SimNet::new(SimNetConfig::default());
        let a = net.endpoint("A");
        a.send("nowhere", vec![0]).await;
        // nothing to assert beyond "does not panic or block"
    }

    #[tokio::test]
    async fn scheduled_drop_skips_then_drops() {
        let net = SimNet::new(SimNetConfig::default());
        let a = net.endpoint("A");
        let b = net.endpoint("B");
        net.drop_matching("A", "B", 1, 1);
        a.send("B", vec![1]).await; // skipped: delivered
        a.send("B", vec![2]).await; // dropped
        a.send("B", vec![3]).await; // delivered
        assert_eq!(b.recv().await.unwrap().payload, [1]);
        assert_eq!(b.recv().await.unwrap().payload, [3]);
    }

    #[tokio::test]
    async fn partition_cuts_both_directions() {
        let net = SimNet::new(SimNetConfig::default());
        let a = net.endpoint("A");
        let b = net.endpoint("B");
        net.partition("B");
        a.send("B", vec![1]).await;
        b.send("A", vec![2]).await;
        net.heal("B");
        a.send("B", vec![3]).await;
        assert_eq!(b.recv().await.unwrap().payload, [3]);
    }

    #[tokio::test]
    async fn same_seed_same_fate() {
        let roll = |seed| async move {
            let net = SimNet::new(SimNetConfig {
                drop_rate: 0.5,
                dup_rate: 0.0,
                seed,
            });
            let a = net.endpoint("A");
            let b = net.endpoint("B");
            for i in 0..20u8 {
                a.send("B", vec![i]).await;
            }
            let mut seen = Vec::new();
            while let Ok(inbound) = b.rx.lock().await.try_recv() {
                seen.push(inbound.payload[0]);
            }
            seen
        };
        assert_eq!(roll(7).await, roll(7).await);
    }
}
