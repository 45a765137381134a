//! Shutdown signal protocol
//!
//! Signal handlers here do the bare minimum a handler may do: an atomic
//! store, one unbuffered `write(2)` of a fixed message, `_exit` for workers
//! and a non-blocking `waitpid` loop for SIGCHLD. Everything else (logging,
//! detaching segments, releasing ledger entries) is done by ordinary code
//! that polls a [`ShutdownFlag`].
//!
//! Handlers are installed without `SA_RESTART`, so a process blocked in a
//! message receive or semaphore wait sees `EINTR` and gets to check the flag.

use crate::error::ShmResult;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use oss_common::role::ProcessRole;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static REAPED_CHILDREN: AtomicUsize = AtomicUsize::new(0);
static HANDLER_ROLE: AtomicU8 = AtomicU8::new(ProcessRole::Coordinator as u8);

const WORKER_EXIT_MSG: &[u8] = b"[Worker] Termination requested by signal, exiting.\n";
const SHUTDOWN_MSG: &[u8] = b"Termination requested by signal, shutting down.\n";

/// Cooperative cancellation flag
///
/// Either bound to the process-wide flag the signal handlers set
/// ([`ShutdownFlag::process`], [`install`]) or a detached flag of its own
/// ([`ShutdownFlag::new`]) so several simulation instances can live in one
/// test process.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    source: FlagSource,
}

#[derive(Debug, Clone)]
enum FlagSource {
    Process,
    Local(Arc<AtomicBool>),
}

impl ShutdownFlag {
    /// A detached flag, not connected to any signal handler
    pub fn new() -> Self {
        Self {
            source: FlagSource::Local(Arc::new(AtomicBool::new(false))),
        }
    }

    /// The flag set by this process's termination handler
    pub fn process() -> Self {
        Self {
            source: FlagSource::Process,
        }
    }

    /// Ask every observer of this flag to stop.
    pub fn request(&self) {
        self.atomic().store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested
    pub fn is_requested(&self) -> bool {
        self.atomic().load(Ordering::SeqCst)
    }

    fn atomic(&self) -> &AtomicBool {
        match &self.source {
            FlagSource::Process => &SHUTDOWN_REQUESTED,
            FlagSource::Local(flag) => flag,
        }
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the SIGINT/SIGTERM and SIGCHLD handlers for `role`.
///
/// Workers terminate on the spot; the coordinator and the timekeeper only
/// raise the returned flag and must wind down themselves.
pub fn install(role: ProcessRole) -> ShmResult<ShutdownFlag> {
    HANDLER_ROLE.store(role as u8, Ordering::SeqCst);

    let terminate = SigAction::new(
        SigHandler::Handler(handle_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let child = SigAction::new(
        SigHandler::Handler(handle_child),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );

    // SAFETY: the handlers only touch atomics and async-signal-safe calls.
    unsafe {
        sigaction(Signal::SIGINT, &terminate)?;
        sigaction(Signal::SIGTERM, &terminate)?;
        sigaction(Signal::SIGCHLD, &child)?;
    }

    tracing::debug!("Signal handlers installed for {}", role);
    Ok(ShutdownFlag::process())
}

/// Install a handler that does nothing, so `signal` interrupts blocking
/// calls (`EINTR`) without killing the process.
pub fn install_wakeup(signal: Signal) -> ShmResult<()> {
    let wake = SigAction::new(
        SigHandler::Handler(handle_wakeup),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler is empty.
    unsafe { sigaction(signal, &wake)? };
    Ok(())
}

/// Children collected by the SIGCHLD handler since the last call
pub fn take_reaped() -> usize {
    REAPED_CHILDREN.swap(0, Ordering::SeqCst)
}

extern "C" fn handle_terminate(_signal: libc::c_int) {
    let saved = errno_get();
    let worker = ProcessRole::from_u8(HANDLER_ROLE.load(Ordering::SeqCst))
        .is_some_and(ProcessRole::exits_on_terminate);
    let msg = if worker { WORKER_EXIT_MSG } else { SHUTDOWN_MSG };
    // SAFETY: write(2) and _exit(2) are async-signal-safe.
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        if worker {
            libc::_exit(libc::EXIT_SUCCESS);
        }
    }
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    errno_set(saved);
}

extern "C" fn handle_child(_signal: libc::c_int) {
    let saved = errno_get();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => {
                REAPED_CHILDREN.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    errno_set(saved);
}

extern "C" fn handle_wakeup(_signal: libc::c_int) {}

fn errno_get() -> libc::c_int {
    // SAFETY: the thread-local errno location is always valid.
    unsafe { *libc::__errno_location() }
}

fn errno_set(value: libc::c_int) {
    // SAFETY: as above.
    unsafe { *libc::__errno_location() = value };
}
