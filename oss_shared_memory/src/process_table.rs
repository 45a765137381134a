//! Process table segment
//!
//! One process control block per potential worker, shared by every
//! simulation process. The coordinator is the only writer and decides which
//! slot a worker gets. This module provides the storage plus mechanical slot
//! helpers. Slots are copied in and out with volatile accesses, so readers in
//! other processes never hold references into memory being rewritten.

use crate::clock::SimulatedClock;
use crate::error::{ShmError, ShmResult};
use crate::platform::is_process_alive;
use crate::segment::Segment;
use oss_common::consts::MAX_USER_PROCESSES;
use serde::Serialize;
use std::ptr::NonNull;

/// Process control block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[repr(C)]
pub struct Pcb {
    /// 1 while a worker owns the slot
    pub occupied: u32,
    /// OS process id of the worker
    pub pid: i32,
    /// Simulated time the worker was admitted
    pub start: SimulatedClock,
    /// Simulated CPU time consumed so far
    pub service_time: SimulatedClock,
    /// Simulated time the worker's pending event completes
    pub event_wait: SimulatedClock,
    /// 1 while the worker waits on an event
    pub blocked: u32,
    /// Scheduling queue the worker currently sits in
    pub queue_level: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<Pcb>(), 40);

impl Pcb {
    /// Whether a worker owns the slot
    pub fn is_occupied(&self) -> bool {
        self.occupied != 0
    }

    /// Whether the worker waits on an event
    pub fn is_blocked(&self) -> bool {
        self.blocked != 0
    }
}

/// Size of the process table segment
pub const PROCESS_TABLE_SIZE: usize = std::mem::size_of::<Pcb>() * MAX_USER_PROCESSES;

/// A process's handle on the shared process table
pub struct ProcessTable {
    segment: Segment,
    slots: NonNull<Pcb>,
}

// SAFETY: slots are only accessed through volatile copies.
unsafe impl Send for ProcessTable {}

impl ProcessTable {
    /// Diagnostic name of the process table segment
    pub const SEGMENT_NAME: &'static str = "Process Table";

    /// Wrap an acquired segment; checks it holds every slot.
    pub fn new(segment: Segment) -> ShmResult<Self> {
        let slots = segment.typed_array_ptr::<Pcb>(MAX_USER_PROCESSES)?;
        Ok(Self { segment, slots })
    }

    /// Number of slots
    pub const fn capacity(&self) -> usize {
        MAX_USER_PROCESSES
    }

    /// Copy of slot `index`
    pub fn slot(&self, index: usize) -> ShmResult<Pcb> {
        Self::check_index(index)?;
        // SAFETY: index checked against the array the segment holds.
        Ok(unsafe { self.slots.as_ptr().add(index).read_volatile() })
    }

    /// Copies of every slot
    pub fn snapshot(&self) -> Vec<Pcb> {
        (0..MAX_USER_PROCESSES)
            // SAFETY: every index is in range.
            .map(|i| unsafe { self.slots.as_ptr().add(i).read_volatile() })
            .collect()
    }

    /// Overwrite slot `index`.
    pub fn write_slot(&mut self, index: usize, pcb: Pcb) -> ShmResult<()> {
        Self::check_index(index)?;
        // SAFETY: index checked against the array the segment holds.
        unsafe { self.slots.as_ptr().add(index).write_volatile(pcb) };
        Ok(())
    }

    /// Read-modify-write slot `index`.
    pub fn update<F>(&mut self, index: usize, f: F) -> ShmResult<Pcb>
    where
        F: FnOnce(&mut Pcb),
    {
        let mut pcb = self.slot(index)?;
        f(&mut pcb);
        self.write_slot(index, pcb)?;
        Ok(pcb)
    }

    /// Reset every slot to empty (simulation start).
    pub fn clear(&mut self) {
        for i in 0..MAX_USER_PROCESSES {
            // SAFETY: every index is in range.
            unsafe { self.slots.as_ptr().add(i).write_volatile(Pcb::default()) };
        }
    }

    /// Put `pid` into the first free slot; `None` when the table is full.
    pub fn claim(&mut self, pid: i32, now: SimulatedClock) -> Option<usize> {
        let index = (0..MAX_USER_PROCESSES).find(|&i| self.slot(i).is_ok_and(|p| !p.is_occupied()))?;
        let pcb = Pcb {
            occupied: 1,
            pid,
            start: now,
            ..Pcb::default()
        };
        self.write_slot(index, pcb).ok()?;
        tracing::debug!("Process {} admitted into slot {}", pid, index);
        Some(index)
    }

    /// Free slot `index`; returns what it held.
    pub fn release(&mut self, index: usize) -> ShmResult<Pcb> {
        let previous = self.slot(index)?;
        self.write_slot(index, Pcb::default())?;
        if previous.is_occupied() {
            tracing::debug!("Process {} released slot {}", previous.pid, index);
        }
        Ok(previous)
    }

    /// Slot currently owned by `pid`
    pub fn find_by_pid(&self, pid: i32) -> Option<usize> {
        (0..MAX_USER_PROCESSES)
            .find(|&i| self.slot(i).is_ok_and(|p| p.is_occupied() && p.pid == pid))
    }

    /// Number of owned slots
    pub fn occupied_count(&self) -> usize {
        self.snapshot().iter().filter(|p| p.is_occupied()).count()
    }

    /// Free slots whose worker no longer exists; returns `(slot, pid)` pairs.
    pub fn prune_dead(&mut self) -> Vec<(usize, i32)> {
        let mut pruned = Vec::new();
        for (index, pcb) in self.snapshot().into_iter().enumerate() {
            if pcb.is_occupied() && !is_process_alive(pcb.pid) && self.release(index).is_ok() {
                tracing::info!("Slot {} held by dead process {} freed", index, pcb.pid);
                pruned.push((index, pcb.pid));
            }
        }
        pruned
    }

    /// The segment backing this table
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Detach from the process table segment.
    pub fn detach(mut self) -> ShmResult<()> {
        self.segment.release()
    }

    fn check_index(index: usize) -> ShmResult<()> {
        if index >= MAX_USER_PROCESSES {
            return Err(ShmError::invalid(format!(
                "process slot {index} outside [0, {MAX_USER_PROCESSES})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn table(anchor: &NamedTempFile) -> ProcessTable {
        let segment = Segment::acquire(
            ProcessTable::SEGMENT_NAME,
            anchor.path(),
            b'p',
            PROCESS_TABLE_SIZE,
        )
        .unwrap();
        let mut table = ProcessTable::new(segment).unwrap();
        table.clear();
        table
    }

    #[test]
    fn claim_fills_lowest_free_slot() {
        let anchor = NamedTempFile::new().unwrap();
        let mut table = table(&anchor);
        let now = SimulatedClock::new(1, 500);

        assert_eq!(table.claim(100, now), Some(0));
        assert_eq!(table.claim(101, now), Some(1));
        table.release(0).unwrap();
        assert_eq!(table.claim(102, now), Some(0));

        let pcb = table.slot(0).unwrap();
        assert!(pcb.is_occupied());
        assert_eq!(pcb.pid, 102);
        assert_eq!(pcb.start, now);
        assert_eq!(table.find_by_pid(101), Some(1));
        assert_eq!(table.occupied_count(), 2);

        table.segment().mark_for_removal().unwrap();
    }

    #[test]
    fn full_table_refuses_claims() {
        let anchor = NamedTempFile::new().unwrap();
        let mut table = table(&anchor);
        for pid in 0..MAX_USER_PROCESSES as i32 {
            assert!(table.claim(1000 + pid, SimulatedClock::default()).is_some());
        }
        assert_eq!(table.claim(9999, SimulatedClock::default()), None);
        table.segment().mark_for_removal().unwrap();
    }

    #[test]
    fn out_of_range_slot_is_invalid() {
        let anchor = NamedTempFile::new().unwrap();
        let mut table = table(&anchor);
        assert!(matches!(
            table.slot(MAX_USER_PROCESSES),
            Err(ShmError::InvalidArgument { .. })
        ));
        assert!(table.write_slot(MAX_USER_PROCESSES, Pcb::default()).is_err());
        table.segment().mark_for_removal().unwrap();
    }

    #[test]
    fn update_is_visible_through_second_mapping() {
        let anchor = NamedTempFile::new().unwrap();
        let mut writer = table(&anchor);
        let reader = ProcessTable::new(
            Segment::acquire("reader", anchor.path(), b'p', PROCESS_TABLE_SIZE).unwrap(),
        )
        .unwrap();

        let index = writer.claim(4242, SimulatedClock::default()).unwrap();
        writer
            .update(index, |pcb| {
                pcb.blocked = 1;
                pcb.queue_level = 2;
            })
            .unwrap();

        let seen = reader.slot(index).unwrap();
        assert!(seen.is_blocked());
        assert_eq!(seen.queue_level, 2);
        writer.segment().mark_for_removal().unwrap();
    }

    #[test]
    fn prune_frees_slots_of_dead_processes() {
        let anchor = NamedTempFile::new().unwrap();
        let mut table = table(&anchor);
        let me = crate::platform::get_current_pid();
        table.claim(me, SimulatedClock::default()).unwrap();
        // pid_max is below this on every default configuration
        let dead = table.claim(i32::MAX - 1, SimulatedClock::default()).unwrap();

        let pruned = table.prune_dead();
        assert_eq!(pruned, vec![(dead, i32::MAX - 1)]);
        assert_eq!(table.occupied_count(), 1);
        table.segment().mark_for_removal().unwrap();
    }
}
