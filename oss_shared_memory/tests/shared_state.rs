//! Launcher/attacher lifecycle of a whole simulation instance

use oss_common::config::IpcConfig;
use oss_common::consts::MAX_RESOURCES;
use oss_shared_memory::{
    Message, NamedSemaphore, SharedState, ShmError, ShmResult, SimulatedClock,
};
use tempfile::TempDir;

fn instance(tag: &str) -> (TempDir, IpcConfig) {
    let dir = TempDir::new().unwrap();
    let config = IpcConfig {
        key_path: dir.path().to_path_buf(),
        msg_key_path: dir.path().to_path_buf(),
        clock_semaphore: format!("/oss_test_{}_{}", std::process::id(), tag),
    };
    (dir, config)
}

#[test]
fn test_attacher_sees_launcher_objects() -> ShmResult<()> {
    let (_dir, config) = instance("lifecycle");
    let mut launcher = SharedState::initialize_with_totals(&config, [3; MAX_RESOURCES])?;
    let worker = SharedState::attach(&config)?;

    {
        let mut clock = launcher.clock.lock()?;
        clock.simulated_mut().advance(1_500_000_000);
    }
    assert_eq!(worker.clock.read()?.0, SimulatedClock::new(1, 500_000_000));
    assert_eq!(worker.clock.gate().value()?, 1);

    let me = std::process::id() as i32;
    let slot = launcher
        .process_table
        .claim(me, SimulatedClock::default())
        .expect("empty table has room");
    assert_eq!(worker.process_table.find_by_pid(me), Some(slot));

    assert!(worker.ledger.request(2, 3, slot)?.is_granted());
    assert_eq!(launcher.ledger.snapshot()?.available[2], 0);

    launcher.queue.send(&Message::new(slot as i64 + 1, 42i32))?;
    let msg = worker.queue.try_receive::<i32>(slot as i64 + 1)?;
    assert_eq!(msg.map(|m| m.payload), Some(42));

    let report = launcher.report()?;
    assert_eq!(report.processes, vec![(slot, me)]);
    assert_eq!(report.pending_messages, 0);
    assert!(report.ledger_consistent);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["available"][2], 0);

    worker.detach()?;
    launcher.detach()?;
    assert_eq!(SharedState::remove_all(&config)?, 6);
    assert_eq!(SharedState::remove_all(&config)?, 0);
    Ok(())
}

#[test]
fn test_initialize_resets_previous_run() -> ShmResult<()> {
    let (_dir, config) = instance("reset");
    let first = SharedState::initialize(&config)?;
    assert!(first.ledger.request(0, 5, 0)?.is_granted());
    first.clock.lock()?.simulated_mut().advance(99);
    first.detach()?;

    let second = SharedState::initialize(&config)?;
    let snapshot = second.ledger.snapshot()?;
    assert_eq!(snapshot.available, snapshot.total);
    assert_eq!(second.clock.read()?.0, SimulatedClock::default());

    second.detach()?;
    SharedState::remove_all(&config)?;
    Ok(())
}

#[test]
fn test_initialize_reopens_gate_left_held() -> ShmResult<()> {
    let (_dir, config) = instance("stale");
    let _ = SharedState::remove_all(&config);
    let crashed = NamedSemaphore::create(&config.clock_semaphore, 0)?;
    assert_eq!(crashed.value()?, 0);

    let launcher = SharedState::initialize(&config)?;
    assert_eq!(launcher.clock.gate().value()?, 1);
    assert_eq!(launcher.clock.read()?.0, SimulatedClock::default());
    assert!(!launcher.clock.reopen_stale_gate()?);
    assert_eq!(launcher.clock.gate().value()?, 1);

    drop(crashed);
    launcher.detach()?;
    SharedState::remove_all(&config)?;
    Ok(())
}

#[test]
fn test_attach_without_launcher_fails() {
    let (_dir, config) = instance("orphan");
    let _ = SharedState::remove_all(&config);

    match SharedState::attach(&config) {
        Err(ShmError::Semaphore { operation, .. }) => assert_eq!(operation, "sem_open"),
        Err(other) => panic!("expected a semaphore error, got {other:?}"),
        Ok(_) => panic!("attach succeeded without a launcher"),
    }
    let _ = SharedState::remove_all(&config);
}
