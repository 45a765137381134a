//! Clock segments and the named semaphore that gates them
//!
//! The simulated clock and the actual elapsed time are plain records in two
//! shared memory segments. They carry no lock of their own: every reader and
//! the single writer (the timekeeper) go through [`SharedClock::lock`], which
//! holds the named POSIX semaphore for the lifetime of the returned guard.

use crate::error::{ShmError, ShmResult};
use crate::platform::name_to_cstring;
use crate::segment::Segment;
use crate::signals::ShutdownFlag;
use nix::errno::Errno;
use oss_common::consts::NANOS_PER_SECOND;
use serde::Serialize;
use std::ptr::NonNull;
use std::time::Duration;

/// Simulated system clock advanced by the timekeeper
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(C)]
pub struct SimulatedClock {
    /// Whole simulated seconds
    pub seconds: u32,
    /// Sub-second part, always below one second
    pub nanoseconds: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<SimulatedClock>(), 8);

impl SimulatedClock {
    /// Clock reading at `seconds` + `nanoseconds`, normalized.
    pub fn new(seconds: u32, nanoseconds: u32) -> Self {
        let mut clock = Self {
            seconds,
            nanoseconds: 0,
        };
        clock.advance(u64::from(nanoseconds));
        clock
    }

    /// Reading from a nanosecond count (seconds saturate at `u32::MAX`)
    pub fn from_nanos(nanos: u64) -> Self {
        let seconds = nanos / u64::from(NANOS_PER_SECOND);
        Self {
            seconds: u32::try_from(seconds).unwrap_or(u32::MAX),
            nanoseconds: (nanos % u64::from(NANOS_PER_SECOND)) as u32,
        }
    }

    /// Total nanoseconds since simulation start
    pub fn as_nanos(&self) -> u64 {
        u64::from(self.seconds) * u64::from(NANOS_PER_SECOND) + u64::from(self.nanoseconds)
    }

    /// Move the clock forward, carrying into seconds.
    pub fn advance(&mut self, nanos: u64) {
        *self = Self::from_nanos(self.as_nanos().saturating_add(nanos));
    }

    /// Reading `nanos` after this one
    pub fn plus(self, nanos: u64) -> Self {
        let mut later = self;
        later.advance(nanos);
        later
    }

    /// Whether this reading has reached `deadline`
    pub fn has_reached(&self, deadline: &Self) -> bool {
        self >= deadline
    }
}

/// Real time elapsed since the simulation started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(C)]
pub struct ActualTime {
    /// Whole seconds
    pub seconds: u64,
    /// Sub-second part in nanoseconds
    pub nanoseconds: u32,
    _pad: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ActualTime>(), 16);

impl ActualTime {
    /// Record for an elapsed duration
    pub fn from_duration(elapsed: Duration) -> Self {
        Self {
            seconds: elapsed.as_secs(),
            nanoseconds: elapsed.subsec_nanos(),
            _pad: 0,
        }
    }

    /// Elapsed duration, saturating at [`Duration::MAX`]
    ///
    /// The record lives in shared memory, so `nanoseconds` is not trusted to
    /// be below one second.
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
            .checked_add(Duration::from_nanos(u64::from(self.nanoseconds)))
            .unwrap_or(Duration::MAX)
    }
}

/// A named POSIX semaphore
#[derive(Debug)]
pub struct NamedSemaphore {
    name: String,
    sem: NonNull<libc::sem_t>,
}

// SAFETY: POSIX semaphores may be used from any thread.
unsafe impl Send for NamedSemaphore {}
// SAFETY: as above.
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create the semaphore, or open it if it already exists.
    ///
    /// `initial` only applies when the semaphore is actually created.
    pub fn create(name: &str, initial: u32) -> ShmResult<Self> {
        Self::open_with(name, libc::O_CREAT, initial)
    }

    /// Open an existing semaphore; fails if the launcher has not created it.
    pub fn open(name: &str) -> ShmResult<Self> {
        Self::open_with(name, 0, 0)
    }

    fn open_with(name: &str, oflag: libc::c_int, initial: u32) -> ShmResult<Self> {
        let c_name = name_to_cstring(name)?;
        let mode: libc::c_uint = 0o666;
        // SAFETY: valid C string; mode and value are only read with O_CREAT.
        let raw = unsafe { libc::sem_open(c_name.as_ptr(), oflag, mode, initial) };
        if raw == libc::SEM_FAILED || raw.is_null() {
            let errno = Errno::last();
            tracing::error!("Failed to create or open semaphore {}: {}", name, errno);
            return Err(ShmError::Semaphore {
                name: name.to_string(),
                operation: "sem_open",
                errno,
            });
        }
        tracing::debug!("Opened semaphore {}", name);
        Ok(Self {
            name: name.to_string(),
            sem: NonNull::new(raw).ok_or_else(|| ShmError::Semaphore {
                name: name.to_string(),
                operation: "sem_open",
                errno: Errno::EINVAL,
            })?,
        })
    }

    /// Semaphore name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decrement, blocking while the value is zero; signal interruptions
    /// are retried.
    pub fn wait(&self) -> ShmResult<()> {
        tracing::trace!("Attempting to acquire semaphore {}...", self.name);
        loop {
            // SAFETY: `sem` is an open semaphore.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                tracing::trace!("Semaphore {} acquired successfully.", self.name);
                return Ok(());
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                tracing::error!("Failed to acquire semaphore {}: {}", self.name, errno);
                return Err(self.error("sem_wait", errno));
            }
        }
    }

    /// Like [`NamedSemaphore::wait`] but gives up with
    /// [`ShmError::Cancelled`] when an interruption finds shutdown requested.
    pub fn wait_cancellable(&self, shutdown: &ShutdownFlag) -> ShmResult<()> {
        loop {
            if shutdown.is_requested() {
                return Err(ShmError::Cancelled);
            }
            // SAFETY: `sem` is an open semaphore.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                tracing::error!("Failed to acquire semaphore {}: {}", self.name, errno);
                return Err(self.error("sem_wait", errno));
            }
        }
    }

    /// Decrement without blocking; `Ok(false)` if the value is zero.
    pub fn try_wait(&self) -> ShmResult<bool> {
        // SAFETY: `sem` is an open semaphore.
        if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::EAGAIN => Ok(false),
            errno => Err(self.error("sem_trywait", errno)),
        }
    }

    /// Increment, waking one waiter.
    pub fn post(&self) -> ShmResult<()> {
        // SAFETY: `sem` is an open semaphore.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            tracing::trace!("Semaphore {} released.", self.name);
            return Ok(());
        }
        let errno = Errno::last();
        tracing::error!("Failed to release semaphore {}: {}", self.name, errno);
        Err(self.error("sem_post", errno))
    }

    /// Current value
    pub fn value(&self) -> ShmResult<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: `sem` is open and `value` is a valid out pointer.
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } == 0 {
            Ok(value)
        } else {
            Err(self.error("sem_getvalue", Errno::last()))
        }
    }

    /// Remove the name from the system; open handles stay usable.
    ///
    /// Returns `Ok(false)` if no semaphore had that name.
    pub fn unlink(name: &str) -> ShmResult<bool> {
        let c_name = name_to_cstring(name)?;
        // SAFETY: valid C string.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            tracing::info!("Unlinked semaphore {}", name);
            return Ok(true);
        }
        match Errno::last() {
            Errno::ENOENT => Ok(false),
            errno => Err(ShmError::Semaphore {
                name: name.to_string(),
                operation: "sem_unlink",
                errno,
            }),
        }
    }

    fn error(&self, operation: &'static str, errno: Errno) -> ShmError {
        ShmError::Semaphore {
            name: self.name.clone(),
            operation,
            errno,
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: opened by sem_open and closed exactly once.
        if unsafe { libc::sem_close(self.sem.as_ptr()) } == -1 {
            tracing::warn!("Closing semaphore {} failed: {}", self.name, Errno::last());
        }
    }
}

/// The two clock segments and their gate
pub struct SharedClock {
    simulated: Segment,
    actual: Segment,
    gate: NamedSemaphore,
}

impl SharedClock {
    /// Diagnostic name of the simulated clock segment
    pub const SIMULATED_SEGMENT: &'static str = "Simulated Clock";
    /// Diagnostic name of the actual time segment
    pub const ACTUAL_SEGMENT: &'static str = "Actual Time";

    /// Wrap already acquired segments; checks they can hold the records.
    pub fn new(simulated: Segment, actual: Segment, gate: NamedSemaphore) -> ShmResult<Self> {
        simulated.typed_ptr::<SimulatedClock>()?;
        actual.typed_ptr::<ActualTime>()?;
        Ok(Self {
            simulated,
            actual,
            gate,
        })
    }

    /// Hold the clock semaphore and access both records.
    pub fn lock(&self) -> ShmResult<ClockGuard<'_>> {
        let simulated = self.simulated.typed_ptr::<SimulatedClock>()?;
        let actual = self.actual.typed_ptr::<ActualTime>()?;
        self.gate.wait()?;
        Ok(ClockGuard {
            gate: &self.gate,
            simulated,
            actual,
        })
    }

    /// Copy of both records taken under the semaphore
    pub fn read(&self) -> ShmResult<(SimulatedClock, ActualTime)> {
        let guard = self.lock()?;
        Ok((guard.simulated(), guard.actual()))
    }

    /// Reopen a gate left at zero by a process that died holding it.
    ///
    /// Only the launcher may call this, before any other process uses the
    /// clock. Returns whether the gate had been left held.
    pub fn reopen_stale_gate(&self) -> ShmResult<bool> {
        let stale = !self.gate.try_wait()?;
        if stale {
            tracing::error!(
                "Clock semaphore {} was left held by a dead process; reopening it",
                self.gate.name()
            );
        }
        self.gate.post()?;
        Ok(stale)
    }

    /// Zero both records (simulation start).
    pub fn reset(&self) -> ShmResult<()> {
        let mut guard = self.lock()?;
        *guard.simulated_mut() = SimulatedClock::default();
        *guard.actual_mut() = ActualTime::default();
        Ok(())
    }

    /// The gate semaphore
    pub fn gate(&self) -> &NamedSemaphore {
        &self.gate
    }

    /// Detach both clock segments; closes the semaphore handle.
    pub fn detach(mut self) -> ShmResult<()> {
        let simulated = self.simulated.release();
        let actual = self.actual.release();
        simulated.and(actual)
    }
}

/// Exclusive access to the clock records; posts the semaphore on drop
pub struct ClockGuard<'a> {
    gate: &'a NamedSemaphore,
    simulated: NonNull<SimulatedClock>,
    actual: NonNull<ActualTime>,
}

impl ClockGuard<'_> {
    /// Simulated clock reading
    pub fn simulated(&self) -> SimulatedClock {
        // SAFETY: the semaphore is held and the mapping is live.
        unsafe { self.simulated.as_ptr().read() }
    }

    /// Simulated clock, writable
    pub fn simulated_mut(&mut self) -> &mut SimulatedClock {
        // SAFETY: the semaphore is held and the mapping is live.
        unsafe { &mut *self.simulated.as_ptr() }
    }

    /// Actual elapsed time
    pub fn actual(&self) -> ActualTime {
        // SAFETY: the semaphore is held and the mapping is live.
        unsafe { self.actual.as_ptr().read() }
    }

    /// Actual elapsed time, writable
    pub fn actual_mut(&mut self) -> &mut ActualTime {
        // SAFETY: the semaphore is held and the mapping is live.
        unsafe { &mut *self.actual.as_ptr() }
    }
}

impl Drop for ClockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.gate.post() {
            tracing::error!("Clock semaphore left held: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_carries_into_seconds() {
        let mut clock = SimulatedClock::new(1, 999_999_000);
        clock.advance(2_000);
        assert_eq!(clock, SimulatedClock::new(2, 1_000));
    }

    #[test]
    fn new_normalizes_nanoseconds() {
        let clock = SimulatedClock::new(0, 2_500_000_000);
        assert_eq!(clock.seconds, 2);
        assert_eq!(clock.nanoseconds, 500_000_000);
    }

    #[test]
    fn ordering_follows_time() {
        let start = SimulatedClock::new(3, 10);
        let deadline = start.plus(1_000_000_000);
        assert!(!start.has_reached(&deadline));
        assert!(deadline.plus(1).has_reached(&deadline));
        assert_eq!(deadline.as_nanos() - start.as_nanos(), 1_000_000_000);
    }

    #[test]
    fn actual_time_roundtrips_duration() {
        let elapsed = Duration::new(12, 345);
        assert_eq!(ActualTime::from_duration(elapsed).as_duration(), elapsed);
    }

    #[test]
    fn corrupt_actual_time_saturates() {
        let mut corrupt = ActualTime::from_duration(Duration::ZERO);
        corrupt.nanoseconds = 2_500_000_000;
        assert_eq!(corrupt.as_duration(), Duration::new(2, 500_000_000));

        corrupt.seconds = u64::MAX;
        assert_eq!(corrupt.as_duration(), Duration::MAX);
    }

    fn semaphore(tag: &str, initial: u32) -> NamedSemaphore {
        let name = format!("/oss_unit_{}_{tag}", std::process::id());
        let sem = NamedSemaphore::create(&name, initial).unwrap();
        NamedSemaphore::unlink(&name).unwrap();
        sem
    }

    #[test]
    fn cancellable_wait_takes_an_open_gate() {
        let sem = semaphore("open", 1);
        sem.wait_cancellable(&ShutdownFlag::new()).unwrap();
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn cancellable_wait_gives_up_once_shutdown_is_requested() {
        let sem = semaphore("held", 0);
        let shutdown = ShutdownFlag::new();
        shutdown.request();
        assert!(matches!(
            sem.wait_cancellable(&shutdown),
            Err(ShmError::Cancelled)
        ));
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn cancellable_wait_is_woken_by_a_post() {
        let sem = semaphore("woken", 0);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| sem.wait_cancellable(&ShutdownFlag::new()));
            std::thread::sleep(Duration::from_millis(20));
            sem.post().unwrap();
            waiter.join().unwrap().unwrap();
        });
    }
}
