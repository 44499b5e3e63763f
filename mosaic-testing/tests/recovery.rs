//! Crash-recovery scenarios: the write-ahead logs are the sole truth, and
//! replay must drive every in-flight transaction to a terminal state.

use std::time::Duration;

use mosaic_coordinator::{CoordinatorWal, Decision, LogRecord, SourceMap};
use mosaic_core::{codec, MessageKind, Transport, WireMessage};
use mosaic_participant::{
    Decision as ParticipantDecision, Participant, ParticipantWal, Policy,
};
use mosaic_testing::cluster::{fast_config, start_coordinator, start_participant, COORDINATOR};
use mosaic_testing::{seed_files, wait_for, SimNet, SimNetConfig};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("mosaic_core=debug,mosaic_coordinator=debug,mosaic_participant=debug")
        }))
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

fn coordinator_record(trans_id: u64, decision: Decision, file: &str, tuples: &[&str]) -> LogRecord {
    LogRecord {
        trans_id,
        decision,
        file_name: file.to_owned(),
        sources: SourceMap::from_tuples(tuples).unwrap(),
    }
}

/// Lay down the on-disk state of a coordinator that crashed mid-protocol.
fn seed_coordinator_log(dir: &std::path::Path, records: &[LogRecord]) {
    let wal = CoordinatorWal::open(dir.join("log")).unwrap();
    for record in records {
        wal.append(record).unwrap();
    }
}

/// Lay down the on-disk state of a participant that promised and crashed.
fn seed_agree(dir: &std::path::Path, id: &str, file: &str, sources: &[&str]) {
    let wal = ParticipantWal::open(dir.join(format!("log_{id}.txt"))).unwrap();
    let sources: Vec<String> = sources.iter().map(|s| (*s).to_owned()).collect();
    wal.append(ParticipantDecision::Agree, file, &sources).unwrap();
}

#[tokio::test]
async fn coordinator_crash_after_prepare_recovers_to_abort() {
    let _guard = init_tracing();
    let net = SimNet::new(SimNetConfig::default());
    let cdir = tempfile::tempdir().unwrap();
    let adir = tempfile::tempdir().unwrap();
    seed_files(adir.path(), &["a1"]);

    // crashed after logging `prepare`; A had voted commit and locked a1
    seed_coordinator_log(
        cdir.path(),
        &[coordinator_record(1, Decision::Prepare, "out.jpg", &["A:a1"])],
    );
    seed_agree(adir.path(), "A", "out.jpg", &["a1"]);

    let (_a, _ha) = start_participant(&net, "A", adir.path(), Policy::ApproveAll);
    let coordinator = start_coordinator(&net, cdir.path(), fast_config());
    coordinator.recover().await.unwrap();

    // the unfinished prepare became a unilateral abort, fully acknowledged
    assert!(std::fs::read_to_string(cdir.path().join("log"))
        .unwrap()
        .is_empty());
    assert!(adir.path().join("a1").exists());
    assert!(!cdir.path().join("out.jpg").exists());

    // A's lock is gone: the same source commits cleanly afterwards
    coordinator
        .start_commit("retry.jpg".to_owned(), b"x".to_vec(), &["A:a1".to_owned()])
        .unwrap();
    assert!(wait_for(|| coordinator.active_files().is_empty(), WAIT).await);
    assert!(cdir.path().join("retry.jpg").exists());
    assert!(!adir.path().join("a1").exists());
}

#[tokio::test]
async fn coordinator_crash_after_commit_resends_the_decision() {
    let _guard = init_tracing();
    let net = SimNet::new(SimNetConfig::default());
    let cdir = tempfile::tempdir().unwrap();
    let adir = tempfile::tempdir().unwrap();
    seed_files(adir.path(), &["a1"]);

    // crashed after the artifact write and the `commit` record, before any
    // participant acknowledged
    std::fs::write(cdir.path().join("out.jpg"), b"assembled").unwrap();
    seed_coordinator_log(
        cdir.path(),
        &[
            coordinator_record(1, Decision::Prepare, "out.jpg", &["A:a1"]),
            coordinator_record(1, Decision::Commit, "out.jpg", &["A:a1"]),
        ],
    );
    seed_agree(adir.path(), "A", "out.jpg", &["a1"]);

    let (_a, _ha) = start_participant(&net, "A", adir.path(), Policy::ApproveAll);
    let coordinator = start_coordinator(&net, cdir.path(), fast_config());
    coordinator.recover().await.unwrap();

    // the commit was resent, applied and acknowledged; artifact untouched
    assert_eq!(
        std::fs::read(cdir.path().join("out.jpg")).unwrap(),
        b"assembled"
    );
    assert!(!adir.path().join("a1").exists());
    assert!(std::fs::read_to_string(cdir.path().join("log"))
        .unwrap()
        .is_empty());

    let plog = std::fs::read_to_string(adir.path().join("log_A.txt")).unwrap();
    assert!(plog.contains("COMMIT out.jpg a1"));
    assert!(plog.contains("Finish out.jpg a1"));
}

#[tokio::test]
async fn participant_crash_after_agree_restores_locks() {
    let _guard = init_tracing();
    let net = SimNet::new(SimNetConfig::default());
    let sink = net.endpoint(COORDINATOR);
    let adir = tempfile::tempdir().unwrap();
    seed_files(adir.path(), &["a1"]);
    seed_agree(adir.path(), "A", "out.jpg", &["a1"]);

    let wal = ParticipantWal::open(adir.path().join("log_A.txt")).unwrap();
    let participant = Participant::new(
        "A".to_owned(),
        net.endpoint("A"),
        wal,
        adir.path().to_owned(),
        Policy::ApproveAll,
    );
    participant.recover().unwrap();

    // the restored lock vetoes a conflicting transaction
    let conflicting =
        WireMessage::prepare("other.jpg".to_owned(), vec![], vec!["a1".to_owned()]);
    participant.handle(COORDINATOR, conflicting).await.unwrap();
    let vote = codec::decode(&sink.recv().await.unwrap().payload).unwrap();
    assert_eq!(vote.kind, MessageKind::VoteAbort);

    // the coordinator's retransmitted decision resolves the open promise
    let decision =
        WireMessage::decision(MessageKind::CommitSuc, "out.jpg".to_owned(), vec!["a1".to_owned()]);
    participant.handle(COORDINATOR, decision).await.unwrap();
    let ack = codec::decode(&sink.recv().await.unwrap().payload).unwrap();
    assert_eq!(ack.kind, MessageKind::Ack);
    assert_eq!(ack.file_name, "out.jpg");
    assert!(!adir.path().join("a1").exists());
}

#[tokio::test]
async fn recovery_replay_is_idempotent() {
    let _guard = init_tracing();
    let net = SimNet::new(SimNetConfig::default());
    let cdir = tempfile::tempdir().unwrap();
    let adir = tempfile::tempdir().unwrap();
    seed_files(adir.path(), &["a1"]);

    std::fs::write(cdir.path().join("out.jpg"), b"assembled").unwrap();
    seed_coordinator_log(
        cdir.path(),
        &[
            coordinator_record(1, Decision::Prepare, "out.jpg", &["A:a1"]),
            coordinator_record(1, Decision::Commit, "out.jpg", &["A:a1"]),
        ],
    );
    seed_agree(adir.path(), "A", "out.jpg", &["a1"]);

    let (_a, _ha) = start_participant(&net, "A", adir.path(), Policy::ApproveAll);
    let coordinator = start_coordinator(&net, cdir.path(), fast_config());

    coordinator.recover().await.unwrap();
    let artifact = std::fs::read(cdir.path().join("out.jpg")).unwrap();

    // a second replay over the (now truncated) log owes nothing and
    // changes nothing
    coordinator.recover().await.unwrap();
    assert_eq!(std::fs::read(cdir.path().join("out.jpg")).unwrap(), artifact);
    assert!(std::fs::read_to_string(cdir.path().join("log"))
        .unwrap()
        .is_empty());
    assert!(coordinator.active_files().is_empty());
}

#[tokio::test]
async fn lossy_duplicating_network_still_reaches_atomic_outcomes() {
    let _guard = init_tracing();
    let net = SimNet::new(SimNetConfig {
        drop_rate: 0.15,
        dup_rate: 0.05,
        seed: 42,
    });
    let cdir = tempfile::tempdir().unwrap();
    let adir = tempfile::tempdir().unwrap();
    let bdir = tempfile::tempdir().unwrap();

    let (_a, _ha) = start_participant(&net, "A", adir.path(), Policy::ApproveAll);
    let (_b, _hb) = start_participant(&net, "B", bdir.path(), Policy::ApproveAll);
    let coordinator = start_coordinator(&net, cdir.path(), fast_config());

    for i in 0..4 {
        let name = format!("out{i}.jpg");
        let src_a = format!("a{i}");
        let src_b = format!("b{i}");
        seed_files(adir.path(), &[src_a.as_str()]);
        seed_files(bdir.path(), &[src_b.as_str()]);

        coordinator
            .start_commit(
                name.clone(),
                format!("collage {i}").into_bytes(),
                &[format!("A:{src_a}"), format!("B:{src_b}")],
            )
            .unwrap();
        assert!(
            wait_for(|| coordinator.active_files().is_empty(), Duration::from_secs(20)).await,
            "transaction {name} should terminate despite loss"
        );

        // atomicity: either the artifact exists and every source is gone,
        // or nothing changed at all
        let committed = cdir.path().join(&name).exists();
        assert_eq!(
            adir.path().join(&src_a).exists(),
            !committed,
            "{name}: A's source must match the outcome"
        );
        assert_eq!(
            bdir.path().join(&src_b).exists(),
            !committed,
            "{name}: B's source must match the outcome"
        );

        // agreement: the log settled on exactly one decision
        let log = std::fs::read_to_string(cdir.path().join("log")).unwrap();
        let commits = log.matches(&format!("\tcommit\t{name}\t")).count();
        let aborts = log.matches(&format!("\tabort\t{name}\t")).count();
        assert_eq!(commits + aborts, 1, "{name}: exactly one decision");
        assert_eq!(commits == 1, committed);
        assert!(log.contains(&format!("\tfinished\t{name}\t")));
    }
}

#[tokio::test]
async fn participant_restart_resumes_from_its_log() {
    let _guard = init_tracing();
    let net = SimNet::new(SimNetConfig::default());
    let cdir = tempfile::tempdir().unwrap();
    let adir = tempfile::tempdir().unwrap();
    seed_files(adir.path(), &["a1"]);

    // First life: vote commit, then "crash" (cut off and drop the node)
    // before the decision arrives.
    net.partition(COORDINATOR);
    let (first_life, first_run) = start_participant(&net, "A", adir.path(), Policy::ApproveAll);
    let prepare = WireMessage::prepare("out.jpg".to_owned(), vec![7], vec!["a1".to_owned()]);
    first_life.handle(COORDINATOR, prepare).await.unwrap();
    first_run.abort();
    drop(first_life);
    net.heal(COORDINATOR);

    // Second life recovers the promise from the log. The coordinator
    // meanwhile had logged its commit, so its replay retransmits the
    // decision, which lands on the restored state.
    std::fs::write(cdir.path().join("out.jpg"), [7]).unwrap();
    seed_coordinator_log(
        cdir.path(),
        &[
            coordinator_record(1, Decision::Prepare, "out.jpg", &["A:a1"]),
            coordinator_record(1, Decision::Commit, "out.jpg", &["A:a1"]),
        ],
    );
    let (_a, _ha) = start_participant(&net, "A", adir.path(), Policy::ApproveAll);
    let coordinator = start_coordinator(&net, cdir.path(), fast_config());
    coordinator.recover().await.unwrap();

    assert!(cdir.path().join("out.jpg").exists());
    assert!(!adir.path().join("a1").exists());
    let plog = std::fs::read_to_string(adir.path().join("log_A.txt")).unwrap();
    assert!(plog.contains("COMMIT out.jpg a1"));
    assert!(plog.contains("Finish out.jpg a1"));
}
