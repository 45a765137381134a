//! Logical role of a simulation process.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which part of the simulation the current process plays.
///
/// Used to tag every log line and to pick the termination behaviour of the
/// signal handlers (workers exit immediately, the others shut down
/// cooperatively).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProcessRole {
    /// The coordinator ("OSS") owning scheduling and admission.
    #[default]
    Coordinator = 0,
    /// A short-lived worker process.
    Worker = 1,
    /// The process advancing the simulated clock.
    Timekeeper = 2,
}

impl ProcessRole {
    /// Tag printed in front of every log line.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Coordinator => "OSS",
            Self::Worker => "Worker",
            Self::Timekeeper => "Timekeeper",
        }
    }

    /// Convert from raw `u8` value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Coordinator),
            1 => Some(Self::Worker),
            2 => Some(Self::Timekeeper),
            _ => None,
        }
    }

    /// Whether a termination signal should end the process on the spot.
    pub const fn exits_on_terminate(self) -> bool {
        matches!(self, Self::Worker)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
