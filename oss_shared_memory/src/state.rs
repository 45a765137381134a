//! Every shared object of one simulation instance in one handle
//!
//! The launcher calls [`SharedState::initialize`] once; every other process
//! calls [`SharedState::attach`] with the same [`IpcConfig`] and ends up with
//! the same queue, clocks, process table and ledger.

use crate::clock::{ActualTime, NamedSemaphore, SharedClock, SimulatedClock};
use crate::error::ShmResult;
use crate::ledger::{Ledger, RESOURCE_TABLE_SIZE};
use crate::msgq::MessageQueue;
use crate::process_table::{PROCESS_TABLE_SIZE, ProcessTable};
use crate::segment::Segment;
use oss_common::config::IpcConfig;
use oss_common::consts::{
    INSTANCES_PER_RESOURCE, MAX_RESOURCES, MSG_PROJ_ID, SHM_PROJ_ID_ACT_TIME,
    SHM_PROJ_ID_PROCESS_TABLE, SHM_PROJ_ID_RESOURCE_TABLE, SHM_PROJ_ID_SIM_CLOCK,
};
use serde::Serialize;

/// Handles on every shared object of a simulation instance
pub struct SharedState {
    /// Message channel between coordinator and workers
    pub queue: MessageQueue,
    /// Simulated clock and actual time, gated by the clock semaphore
    pub clock: SharedClock,
    /// Worker control blocks
    pub process_table: ProcessTable,
    /// Resource accounting
    pub ledger: Ledger,
}

/// Point-in-time copy of the shared state, for reporting
#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    /// Simulated clock reading
    pub simulated: SimulatedClock,
    /// Real time elapsed, in seconds
    pub actual_seconds: f64,
    /// Messages waiting in the channel
    pub pending_messages: u64,
    /// Occupied process slots as `(slot, pid)`
    pub processes: Vec<(usize, i32)>,
    /// Ledger totals per resource type
    pub total: Vec<i32>,
    /// Ledger free units per resource type
    pub available: Vec<i32>,
    /// Whether the ledger conservation invariant holds
    pub ledger_consistent: bool,
}

impl SharedState {
    /// Launcher path: create every object and initialize its contents.
    pub fn initialize(config: &IpcConfig) -> ShmResult<Self> {
        Self::initialize_with_totals(config, [INSTANCES_PER_RESOURCE; MAX_RESOURCES])
    }

    /// Launcher path with explicit per-resource totals.
    pub fn initialize_with_totals(
        config: &IpcConfig,
        totals: [i32; MAX_RESOURCES],
    ) -> ShmResult<Self> {
        tracing::info!("Initializing shared resources...");
        let queue = MessageQueue::open(&config.msg_key_path, MSG_PROJ_ID)?;
        let gate = NamedSemaphore::create(&config.clock_semaphore, 1)?;
        let clock = Self::clock_segments(config, gate)?;
        clock.reopen_stale_gate()?;
        clock.reset()?;

        let mut process_table = Self::process_table(config)?;
        process_table.clear();

        let ledger = Ledger::initialize(Self::ledger_segment(config)?, totals)?;
        tracing::info!("Shared resources initialized successfully.");

        Ok(Self {
            queue,
            clock,
            process_table,
            ledger,
        })
    }

    /// Every other process: attach to what the launcher created.
    pub fn attach(config: &IpcConfig) -> ShmResult<Self> {
        let queue = MessageQueue::open(&config.msg_key_path, MSG_PROJ_ID)?;
        let gate = NamedSemaphore::open(&config.clock_semaphore)?;
        let clock = Self::clock_segments(config, gate)?;
        let process_table = Self::process_table(config)?;
        let ledger = Ledger::attach(Self::ledger_segment(config)?)?;
        tracing::debug!("Attached to shared resources.");

        Ok(Self {
            queue,
            clock,
            process_table,
            ledger,
        })
    }

    /// Snapshot for status reporting
    pub fn report(&self) -> ShmResult<StateReport> {
        let (simulated, actual) = self.clock.read()?;
        let counts = self.ledger.snapshot()?;
        let processes = self
            .process_table
            .snapshot()
            .iter()
            .enumerate()
            .filter(|(_, pcb)| pcb.is_occupied())
            .map(|(slot, pcb)| (slot, pcb.pid))
            .collect();

        Ok(StateReport {
            simulated,
            actual_seconds: actual.as_duration().as_secs_f64(),
            pending_messages: self.queue.pending()?,
            processes,
            total: counts.total.to_vec(),
            available: counts.available.to_vec(),
            ledger_consistent: counts.is_consistent(),
        })
    }

    /// Detach every segment from this process. The queue and the kernel
    /// objects stay; see [`SharedState::remove_all`].
    pub fn detach(self) -> ShmResult<()> {
        let clock = self.clock.detach();
        let table = self.process_table.detach();
        let ledger = self.ledger.detach();
        clock.and(table).and(ledger)
    }

    /// Remove every kernel object of the instance described by `config`.
    ///
    /// Objects that do not exist are skipped; returns how many were removed.
    pub fn remove_all(config: &IpcConfig) -> ShmResult<usize> {
        let segments = [
            (SharedClock::SIMULATED_SEGMENT, SHM_PROJ_ID_SIM_CLOCK),
            (SharedClock::ACTUAL_SEGMENT, SHM_PROJ_ID_ACT_TIME),
            (ProcessTable::SEGMENT_NAME, SHM_PROJ_ID_PROCESS_TABLE),
            (Ledger::SEGMENT_NAME, SHM_PROJ_ID_RESOURCE_TABLE),
        ];

        let mut removed = 0;
        for (name, project_id) in segments {
            if Segment::remove(name, &config.key_path, project_id)? {
                removed += 1;
            }
        }
        if MessageQueue::remove_key(&config.msg_key_path, MSG_PROJ_ID)? {
            removed += 1;
        }
        if NamedSemaphore::unlink(&config.clock_semaphore)? {
            removed += 1;
        }
        tracing::info!("Removed {} shared objects", removed);
        Ok(removed)
    }

    fn clock_segments(config: &IpcConfig, gate: NamedSemaphore) -> ShmResult<SharedClock> {
        let simulated = Segment::acquire(
            SharedClock::SIMULATED_SEGMENT,
            &config.key_path,
            SHM_PROJ_ID_SIM_CLOCK,
            std::mem::size_of::<SimulatedClock>(),
        )?;
        let actual = Segment::acquire(
            SharedClock::ACTUAL_SEGMENT,
            &config.key_path,
            SHM_PROJ_ID_ACT_TIME,
            std::mem::size_of::<ActualTime>(),
        )?;
        SharedClock::new(simulated, actual, gate)
    }

    fn process_table(config: &IpcConfig) -> ShmResult<ProcessTable> {
        ProcessTable::new(Segment::acquire(
            ProcessTable::SEGMENT_NAME,
            &config.key_path,
            SHM_PROJ_ID_PROCESS_TABLE,
            PROCESS_TABLE_SIZE,
        )?)
    }

    fn ledger_segment(config: &IpcConfig) -> ShmResult<Segment> {
        Segment::acquire(
            Ledger::SEGMENT_NAME,
            &config.key_path,
            SHM_PROJ_ID_RESOURCE_TABLE,
            RESOURCE_TABLE_SIZE,
        )
    }
}
