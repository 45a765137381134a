//! Message transport tests: blocking receives, wake-ups and cancellation

use nix::sys::signal::Signal;
use oss_shared_memory::signals::{self, ShutdownFlag};
use oss_shared_memory::{Message, MessageQueue, RecvFlags, ShmError, ShmResult};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

const PROJECT_ID: u8 = b'm';

#[test]
fn test_blocking_receive_wakes_on_matching_kind() -> ShmResult<()> {
    let anchor = NamedTempFile::new()?;
    let queue = MessageQueue::open(anchor.path(), PROJECT_ID)?;
    let shutdown = ShutdownFlag::new();

    let received = thread::scope(|s| {
        let receiver = s.spawn(|| queue.receive::<i32>(3, RecvFlags::empty(), &shutdown));
        thread::sleep(Duration::from_millis(50));
        queue.send(&Message::new(1, 100))?;
        queue.send(&Message::new(3, 300))?;
        receiver.join().unwrap()
    })?;

    assert_eq!(received, Message::new(3, 300));
    assert_eq!(queue.try_receive::<i32>(1)?, Some(Message::new(1, 100)));
    assert_eq!(queue.pending()?, 0);
    queue.remove()
}

#[test]
fn test_signal_with_shutdown_cancels_blocked_receive() -> ShmResult<()> {
    let anchor = NamedTempFile::new()?;
    let queue = MessageQueue::open(anchor.path(), PROJECT_ID)?;
    let shutdown = ShutdownFlag::new();
    signals::install_wakeup(Signal::SIGUSR1)?;

    let outcome = thread::scope(|s| {
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let queue = &queue;
        let flag = shutdown.clone();

        s.spawn(move || {
            // SAFETY: pthread_self has no preconditions.
            tid_tx.send(unsafe { libc::pthread_self() }).unwrap();
            let result = queue.receive::<i32>(0, RecvFlags::empty(), &flag);
            done_tx.send(result).unwrap();
        });

        let tid = tid_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        shutdown.request();

        // Keep signalling in case the first one landed before msgrcv
        loop {
            // SAFETY: the receiver thread is alive until it reports back.
            unsafe { libc::pthread_kill(tid, libc::SIGUSR1) };
            match done_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(result) => break result,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(e) => panic!("receiver vanished: {e}"),
            }
        }
    });

    assert!(matches!(outcome, Err(ShmError::Cancelled)));
    queue.remove()
}

#[test]
fn test_signal_without_shutdown_keeps_waiting() -> ShmResult<()> {
    let anchor = NamedTempFile::new()?;
    let queue = MessageQueue::open(anchor.path(), PROJECT_ID)?;
    let shutdown = ShutdownFlag::new();
    signals::install_wakeup(Signal::SIGUSR2)?;

    let received = thread::scope(|s| {
        let (tid_tx, tid_rx) = mpsc::channel();
        let queue = &queue;
        let flag = shutdown.clone();

        let receiver = s.spawn(move || {
            // SAFETY: pthread_self has no preconditions.
            tid_tx.send(unsafe { libc::pthread_self() }).unwrap();
            queue.receive::<i32>(5, RecvFlags::empty(), &flag)
        });

        let tid = tid_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        for _ in 0..3 {
            // SAFETY: the receiver is blocked until the message below.
            unsafe { libc::pthread_kill(tid, libc::SIGUSR2) };
            thread::sleep(Duration::from_millis(20));
        }
        queue.send(&Message::new(5, 55))?;
        receiver.join().unwrap()
    })?;

    assert_eq!(received.payload, 55);
    queue.remove()
}

#[test]
fn test_removed_queue_fails_sends() -> ShmResult<()> {
    let anchor = NamedTempFile::new()?;
    let queue = MessageQueue::open(anchor.path(), PROJECT_ID)?;
    let stale = MessageQueue::open(anchor.path(), PROJECT_ID)?;
    assert_eq!(queue.id(), stale.id());

    assert!(MessageQueue::remove_key(anchor.path(), PROJECT_ID)?);
    assert!(matches!(
        stale.send(&Message::new(1, 1i32)),
        Err(ShmError::TransportFailure { .. })
    ));
    assert!(!MessageQueue::remove_key(anchor.path(), PROJECT_ID)?);
    Ok(())
}
