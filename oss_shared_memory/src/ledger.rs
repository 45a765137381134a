//! Resource ledger shared by every simulation process
//!
//! The ledger records, per resource type, the immutable `total`, the
//! `available` pool and what each process slot has been `allocated`. At every
//! observable instant `available[r] + Σ allocated[p][r] == total[r]` and no
//! `allocated` entry is negative.
//!
//! The table lives in a shared memory segment together with its lock: a
//! process-shared, robust pthread mutex. Any process mapping the segment
//! therefore excludes every other one, not just sibling threads. If a holder
//! dies inside the critical section, the next locker rebuilds `available`
//! from the `allocated` column, which is always written first.
//!
//! ```text
//! ┌──────────────────────── Resource Table segment ────────────────────────┐
//! │ pthread_mutex_t (pshared, robust) │ magic │ total[R] │ available[R]    │
//! │ allocated[P][R]                                                        │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{ShmError, ShmResult};
use crate::segment::Segment;
use nix::errno::Errno;
use oss_common::consts::{MAX_RESOURCES, MAX_USER_PROCESSES};
use serde::Serialize;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

/// Marks a table initialized by [`Ledger::initialize`]: `"OSSL"`
pub const LEDGER_MAGIC: u32 = 0x4F53_534C;

/// Outcome of a well-formed resource request
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// The units were moved from `available` to the caller's allocation
    Granted,
    /// Not enough units available; nothing changed
    Denied,
}

impl Grant {
    /// Whether the request was satisfied
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// The counters of the ledger, without the lock
///
/// All mutation goes through [`ResourceCounts::try_request`] and
/// [`ResourceCounts::try_release`], which validate their operands and keep
/// the ledger invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(C)]
pub struct ResourceCounts {
    /// Units of each type in the system
    pub total: [i32; MAX_RESOURCES],
    /// Units of each type not allocated to anyone
    pub available: [i32; MAX_RESOURCES],
    /// Units of each type held by each process slot
    pub allocated: [[i32; MAX_RESOURCES]; MAX_USER_PROCESSES],
}

impl ResourceCounts {
    /// Fresh counts: everything available, nothing allocated.
    pub fn new(totals: [i32; MAX_RESOURCES]) -> Self {
        Self {
            total: totals,
            available: totals,
            allocated: [[0; MAX_RESOURCES]; MAX_USER_PROCESSES],
        }
    }

    /// Reject out-of-range operands before touching anything.
    pub fn validate(resource: usize, quantity: i32, slot: usize) -> ShmResult<()> {
        if resource >= MAX_RESOURCES {
            return Err(ShmError::invalid(format!(
                "resource type {resource} outside [0, {MAX_RESOURCES})"
            )));
        }
        if quantity <= 0 {
            return Err(ShmError::invalid(format!(
                "quantity {quantity} must be positive"
            )));
        }
        if slot >= MAX_USER_PROCESSES {
            return Err(ShmError::invalid(format!(
                "process slot {slot} outside [0, {MAX_USER_PROCESSES})"
            )));
        }
        Ok(())
    }

    /// Move `quantity` units of `resource` to `slot` if enough are available.
    pub fn try_request(&mut self, resource: usize, quantity: i32, slot: usize) -> ShmResult<Grant> {
        Self::validate(resource, quantity, slot)?;
        if self.available[resource] < quantity {
            return Ok(Grant::Denied);
        }
        // allocated first: a crash between the two stores is repaired from it
        self.allocated[slot][resource] += quantity;
        self.available[resource] -= quantity;
        Ok(Grant::Granted)
    }

    /// Return `quantity` units of `resource` held by `slot` to the pool.
    ///
    /// Releasing more than held is refused and leaves the counts unchanged.
    pub fn try_release(&mut self, resource: usize, quantity: i32, slot: usize) -> ShmResult<()> {
        Self::validate(resource, quantity, slot)?;
        let held = self.allocated[slot][resource];
        if held < quantity {
            return Err(ShmError::OverRelease {
                slot,
                resource,
                requested: quantity,
                held,
            });
        }
        self.allocated[slot][resource] -= quantity;
        self.available[resource] += quantity;
        Ok(())
    }

    /// Return everything `slot` holds; yields the released amounts.
    pub fn release_slot(&mut self, slot: usize) -> ShmResult<[i32; MAX_RESOURCES]> {
        if slot >= MAX_USER_PROCESSES {
            return Err(ShmError::invalid(format!(
                "process slot {slot} outside [0, {MAX_USER_PROCESSES})"
            )));
        }
        let released = self.allocated[slot];
        for (resource, &units) in released.iter().enumerate() {
            self.allocated[slot][resource] = 0;
            self.available[resource] += units;
        }
        Ok(released)
    }

    /// Units of `resource` held by `slot` (0 for out-of-range operands)
    pub fn held(&self, slot: usize, resource: usize) -> i32 {
        self.allocated
            .get(slot)
            .and_then(|row| row.get(resource))
            .copied()
            .unwrap_or(0)
    }

    /// First resource type whose counters break the ledger invariant
    pub fn invariant_violation(&self) -> Option<usize> {
        (0..MAX_RESOURCES).find(|&r| {
            let held: i32 = self.allocated.iter().map(|row| row[r]).sum();
            let negative = self.allocated.iter().any(|row| row[r] < 0);
            negative || self.available[r] < 0 || self.available[r] + held != self.total[r]
        })
    }

    /// Whether the ledger invariant holds for every resource type
    pub fn is_consistent(&self) -> bool {
        self.invariant_violation().is_none()
    }

    /// Recompute `available` from `total` and the `allocated` column.
    pub fn repair_available(&mut self) {
        for r in 0..MAX_RESOURCES {
            let held: i32 = self.allocated.iter().map(|row| row[r]).sum();
            self.available[r] = self.total[r] - held;
        }
    }
}

/// In-segment layout of the ledger
#[repr(C)]
pub struct ResourceTable {
    lock: libc::pthread_mutex_t,
    magic: u32,
    counts: ResourceCounts,
}

static_assertions::const_assert!(std::mem::align_of::<ResourceTable>() <= 4096);

/// Size of the resource table segment
pub const RESOURCE_TABLE_SIZE: usize = std::mem::size_of::<ResourceTable>();

/// A process's handle on the shared ledger
pub struct Ledger {
    segment: Segment,
    table: NonNull<ResourceTable>,
}

// SAFETY: every access to the counters goes through the in-segment mutex.
unsafe impl Send for Ledger {}
// SAFETY: as above; the pthread mutex also excludes threads of one process.
unsafe impl Sync for Ledger {}

impl Ledger {
    /// Diagnostic name of the ledger segment
    pub const SEGMENT_NAME: &'static str = "Resource Table";

    /// Set up a fresh ledger in `segment`: lock, magic, `available = total`.
    ///
    /// Must run once per simulation instance, before any other process
    /// attaches. Re-initializing while another process holds the lock is
    /// undefined behaviour at the pthread level.
    pub fn initialize(segment: Segment, totals: [i32; MAX_RESOURCES]) -> ShmResult<Self> {
        if let Some(r) = totals.iter().position(|&t| t < 0) {
            return Err(ShmError::invalid(format!(
                "total for resource {r} is negative ({})",
                totals[r]
            )));
        }

        let table = segment.typed_ptr::<ResourceTable>()?;
        let raw = table.as_ptr();

        // SAFETY: the segment is large enough and aligned (checked above);
        // nobody else uses the table before initialization completes.
        unsafe {
            ptr::addr_of_mut!((*raw).magic).write(0);
            init_shared_mutex(ptr::addr_of_mut!((*raw).lock))?;
            ptr::addr_of_mut!((*raw).counts).write(ResourceCounts::new(totals));
            ptr::addr_of_mut!((*raw).magic).write(LEDGER_MAGIC);
        }

        tracing::info!("Resource Descriptors successfully initialized.");
        Ok(Self { segment, table })
    }

    /// Attach to a ledger a launcher already initialized.
    pub fn attach(segment: Segment) -> ShmResult<Self> {
        let table = segment.typed_ptr::<ResourceTable>()?;
        // SAFETY: size and alignment checked; magic is a plain u32.
        let magic = unsafe { ptr::addr_of!((*table.as_ptr()).magic).read_volatile() };
        if magic != LEDGER_MAGIC {
            tracing::error!(
                "{} segment found without an initialized ledger (magic {:#x})",
                Self::SEGMENT_NAME,
                magic
            );
            return Err(ShmError::NotInitialized {
                name: Self::SEGMENT_NAME.to_string(),
            });
        }
        Ok(Self { segment, table })
    }

    /// Request `quantity` units of `resource` on behalf of process `slot`.
    ///
    /// `Denied` is a normal outcome; retry policy belongs to the caller.
    pub fn request(&self, resource: usize, quantity: i32, slot: usize) -> ShmResult<Grant> {
        if let Err(e) = ResourceCounts::validate(resource, quantity, slot) {
            tracing::error!(
                "Invalid request parameters: resource {} quantity {} slot {}: {}",
                resource,
                quantity,
                slot,
                e
            );
            return Err(e);
        }

        let outcome = {
            let mut guard = self.lock()?;
            guard.try_request(resource, quantity, slot)?
        };

        match outcome {
            Grant::Granted => tracing::info!(
                "Resource {} x{} allocated to process slot {}.",
                resource,
                quantity,
                slot
            ),
            Grant::Denied => tracing::warn!(
                "Resource {} x{} request by process slot {} cannot be satisfied currently.",
                resource,
                quantity,
                slot
            ),
        }
        Ok(outcome)
    }

    /// Release `quantity` units of `resource` held by process `slot`.
    pub fn release(&self, resource: usize, quantity: i32, slot: usize) -> ShmResult<()> {
        let result = match ResourceCounts::validate(resource, quantity, slot) {
            Ok(()) => {
                let mut guard = self.lock()?;
                guard.try_release(resource, quantity, slot)
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => tracing::info!(
                "Resource {} x{} released by process slot {}.",
                resource,
                quantity,
                slot
            ),
            Err(e) => tracing::error!("Release refused: {}", e),
        }
        result
    }

    /// Return every unit held by `slot`, typically when its worker is reaped.
    pub fn release_all(&self, slot: usize) -> ShmResult<[i32; MAX_RESOURCES]> {
        let released = {
            let mut guard = self.lock()?;
            guard.release_slot(slot)?
        };
        let units: i32 = released.iter().sum();
        if units > 0 {
            tracing::info!(
                "Returned {} units held by process slot {}: {:?}",
                units,
                slot,
                released
            );
        }
        Ok(released)
    }

    /// Consistent copy of the counters
    pub fn snapshot(&self) -> ShmResult<ResourceCounts> {
        let guard = self.lock()?;
        Ok(*guard)
    }

    /// The segment backing this ledger
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Detach from the ledger segment.
    pub fn detach(mut self) -> ShmResult<()> {
        self.segment.release()
    }

    fn lock(&self) -> ShmResult<LedgerGuard<'_>> {
        let raw = self.table.as_ptr();
        // SAFETY: `raw` points at an initialized table in a live mapping.
        let lock = unsafe { ptr::addr_of_mut!((*raw).lock) };
        // SAFETY: the mutex was initialized by `Ledger::initialize`.
        let rc = unsafe { libc::pthread_mutex_lock(lock) };
        match rc {
            0 => {}
            libc::EOWNERDEAD => {
                // SAFETY: we own the mutex now; the counters are ours to fix.
                unsafe { (*raw).counts.repair_available() };
                // SAFETY: we hold the mutex in the EOWNERDEAD state.
                let rc = unsafe { libc::pthread_mutex_consistent(lock) };
                if rc != 0 {
                    // SAFETY: still held by us.
                    unsafe { libc::pthread_mutex_unlock(lock) };
                    return Err(ShmError::Lock {
                        name: Self::SEGMENT_NAME.to_string(),
                        operation: "pthread_mutex_consistent",
                        errno: Errno::from_raw(rc),
                    });
                }
                tracing::warn!(
                    "Previous ledger holder died inside the critical section; available counts rebuilt"
                );
            }
            err => {
                tracing::error!("Locking the ledger failed: {}", Errno::from_raw(err));
                return Err(ShmError::Lock {
                    name: Self::SEGMENT_NAME.to_string(),
                    operation: "pthread_mutex_lock",
                    errno: Errno::from_raw(err),
                });
            }
        }
        Ok(LedgerGuard {
            table: self.table,
            _ledger: PhantomData,
        })
    }
}

/// Exclusive access to the counters; unlocks on drop
struct LedgerGuard<'a> {
    table: NonNull<ResourceTable>,
    _ledger: PhantomData<&'a Ledger>,
}

impl Deref for LedgerGuard<'_> {
    type Target = ResourceCounts;

    fn deref(&self) -> &ResourceCounts {
        // SAFETY: the mutex is held for the guard's lifetime.
        unsafe { &(*self.table.as_ptr()).counts }
    }
}

impl DerefMut for LedgerGuard<'_> {
    fn deref_mut(&mut self) -> &mut ResourceCounts {
        // SAFETY: the mutex is held for the guard's lifetime.
        unsafe { &mut (*self.table.as_ptr()).counts }
    }
}

impl Drop for LedgerGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: locked in `Ledger::lock`, unlocked exactly once here.
        unsafe { libc::pthread_mutex_unlock(ptr::addr_of_mut!((*self.table.as_ptr()).lock)) };
    }
}

/// Initialize a process-shared, robust mutex in place.
///
/// # Safety
///
/// `lock` must point to writable memory not currently used as a mutex.
unsafe fn init_shared_mutex(lock: *mut libc::pthread_mutex_t) -> ShmResult<()> {
    let check = |rc: libc::c_int, operation: &'static str| -> ShmResult<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(ShmError::Lock {
                name: Ledger::SEGMENT_NAME.to_string(),
                operation,
                errno: Errno::from_raw(rc),
            })
        }
    };

    // SAFETY: attr is initialized by pthread_mutexattr_init before use.
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        check(libc::pthread_mutexattr_init(&mut attr), "pthread_mutexattr_init")?;
        let result = check(
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
            "pthread_mutexattr_setpshared",
        )
        .and_then(|()| {
            check(
                libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
                "pthread_mutexattr_setrobust",
            )
        })
        .and_then(|()| check(libc::pthread_mutex_init(lock, &attr), "pthread_mutex_init"));
        libc::pthread_mutexattr_destroy(&mut attr);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oss_common::consts::INSTANCES_PER_RESOURCE;

    fn counts() -> ResourceCounts {
        ResourceCounts::new([INSTANCES_PER_RESOURCE; MAX_RESOURCES])
    }

    #[test]
    fn fresh_counts_are_consistent() {
        let c = counts();
        assert!(c.is_consistent());
        assert_eq!(c.available, c.total);
        assert!(c.allocated.iter().flatten().all(|&a| a == 0));
    }

    #[test]
    fn request_moves_units_to_slot() {
        let mut c = counts();
        assert_eq!(c.try_request(2, 5, 1).unwrap(), Grant::Granted);
        assert_eq!(c.available[2], INSTANCES_PER_RESOURCE - 5);
        assert_eq!(c.held(1, 2), 5);
        assert!(c.is_consistent());
    }

    #[test]
    fn invalid_operands_are_rejected_without_side_effects() {
        let mut c = counts();
        let before = c;
        for (resource, quantity, slot) in [
            (MAX_RESOURCES, 1, 0),
            (0, 0, 0),
            (0, -3, 0),
            (0, 1, MAX_USER_PROCESSES),
        ] {
            assert!(matches!(
                c.try_request(resource, quantity, slot),
                Err(ShmError::InvalidArgument { .. })
            ));
            assert!(matches!(
                c.try_release(resource, quantity, slot),
                Err(ShmError::InvalidArgument { .. })
            ));
        }
        assert_eq!(c, before);
    }

    #[test]
    fn over_release_is_refused_not_clamped() {
        let mut c = counts();
        assert!(c.try_request(0, 2, 4).unwrap().is_granted());
        let before = c;
        let err = c.try_release(0, 3, 4).unwrap_err();
        assert!(matches!(
            err,
            ShmError::OverRelease {
                slot: 4,
                resource: 0,
                requested: 3,
                held: 2
            }
        ));
        assert_eq!(c, before);
    }

    #[test]
    fn release_slot_returns_everything() {
        let mut c = counts();
        assert!(c.try_request(0, 2, 3).unwrap().is_granted());
        assert!(c.try_request(5, 7, 3).unwrap().is_granted());
        assert!(c.try_request(5, 1, 4).unwrap().is_granted());

        let released = c.release_slot(3).unwrap();
        assert_eq!(released[0], 2);
        assert_eq!(released[5], 7);
        assert_eq!(c.held(3, 5), 0);
        assert_eq!(c.held(4, 5), 1);
        assert!(c.is_consistent());
        assert!(c.release_slot(MAX_USER_PROCESSES).is_err());
    }

    #[test]
    fn repair_rebuilds_available_from_allocations() {
        let mut c = counts();
        assert!(c.try_request(1, 4, 0).unwrap().is_granted());
        // simulate a holder killed between the two stores of a request
        c.allocated[2][1] += 3;
        assert_eq!(c.invariant_violation(), Some(1));

        c.repair_available();
        assert!(c.is_consistent());
        assert_eq!(c.available[1], INSTANCES_PER_RESOURCE - 7);
    }

    #[test]
    fn lock_holder_death_is_repaired_by_next_request() {
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::{ForkResult, fork};

        let anchor = tempfile::NamedTempFile::new().unwrap();
        let segment =
            Segment::acquire(Ledger::SEGMENT_NAME, anchor.path(), 4, RESOURCE_TABLE_SIZE).unwrap();
        let mut totals = [0; MAX_RESOURCES];
        totals[1] = 4;
        let ledger = Ledger::initialize(segment, totals).unwrap();
        ledger.segment().mark_for_removal().unwrap();

        // SAFETY: the child only touches the mapped ledger and then _exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match ledger.lock() {
                    Ok(mut guard) => {
                        // die after the allocation store, before the available one
                        guard.allocated[3][1] += 3;
                        std::mem::forget(guard);
                        0
                    }
                    Err(_) => 1,
                };
                // SAFETY: leave without unlocking or running destructors.
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }

        assert_eq!(ledger.request(1, 1, 0).unwrap(), Grant::Granted);
        let snapshot = ledger.snapshot().unwrap();
        assert!(snapshot.is_consistent());
        assert_eq!(snapshot.held(3, 1), 3);
        assert_eq!(snapshot.available[1], 0);

        // the mutex is usable again without another repair
        ledger.release(1, 1, 0).unwrap();
        assert_eq!(ledger.snapshot().unwrap().available[1], 1);
    }

    #[test]
    fn table_fits_one_allocation() {
        assert!(RESOURCE_TABLE_SIZE >= std::mem::size_of::<ResourceCounts>());
    }
}
