//! System-wide constants for the OSS workspace.
//!
//! Every process attaching to the shared objects must be built with the same
//! values: nothing here is transmitted at runtime.

/// Number of distinct resource types tracked by the ledger.
pub const MAX_RESOURCES: usize = 10;

/// Instances of each resource type available at simulation start.
pub const INSTANCES_PER_RESOURCE: i32 = 20;

/// Maximum number of concurrently tracked worker processes (process slots).
pub const MAX_USER_PROCESSES: usize = 18;

/// Default reference path for shared memory key derivation.
///
/// Must exist on the host: `ftok` derives the key from its inode.
pub const DEFAULT_SHM_PATH: &str = "/tmp";

/// Default reference path for the message queue key.
pub const DEFAULT_MSG_PATH: &str = "/tmp";

/// Project id of the simulated clock segment.
pub const SHM_PROJ_ID_SIM_CLOCK: u8 = 1;

/// Project id of the actual (wall) elapsed time segment.
pub const SHM_PROJ_ID_ACT_TIME: u8 = 2;

/// Project id of the process table segment.
pub const SHM_PROJ_ID_PROCESS_TABLE: u8 = 3;

/// Project id of the resource table (ledger) segment.
pub const SHM_PROJ_ID_RESOURCE_TABLE: u8 = 4;

/// Project id of the message queue.
pub const MSG_PROJ_ID: u8 = b'm';

/// Name of the POSIX semaphore gating the clock segments.
pub const CLOCK_SEM_NAME: &str = "/simClockSem";

/// Default log file name.
pub const DEFAULT_LOG_FILE_NAME: &str = "oss.log";

/// Nanoseconds per simulated second.
pub const NANOS_PER_SECOND: u32 = 1_000_000_000;

static_assertions::const_assert!(MAX_RESOURCES > 0);
static_assertions::const_assert!(MAX_USER_PROCESSES > 0);
static_assertions::const_assert!(INSTANCES_PER_RESOURCE > 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids_are_distinct() {
        let ids = [
            SHM_PROJ_ID_SIM_CLOCK,
            SHM_PROJ_ID_ACT_TIME,
            SHM_PROJ_ID_PROCESS_TABLE,
            SHM_PROJ_ID_RESOURCE_TABLE,
        ];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
            // ftok only uses the low 8 bits and 0 is reserved
            assert_ne!(*a, 0);
        }
        assert_ne!(MSG_PROJ_ID, 0);
    }

    #[test]
    fn semaphore_name_is_posix_style() {
        assert!(CLOCK_SEM_NAME.starts_with('/'));
        assert!(!CLOCK_SEM_NAME[1..].contains('/'));
    }
}
