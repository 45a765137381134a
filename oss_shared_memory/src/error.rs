//! Error types for the shared-state and transport layer

use nix::errno::Errno;
use thiserror::Error;

/// Errors that can occur in segment, ledger, clock and transport operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// `ftok` could not derive a key; no shared state is reachable
    #[error("Key derivation failed for {path} (project id {project_id}): {errno}")]
    KeyDerivation {
        /// Reference path handed to `ftok`
        path: String,
        /// Project id handed to `ftok`
        project_id: u8,
        /// Error reported by the kernel
        errno: Errno,
    },

    /// Segment could not be created, attached or queried
    #[error("Segment {name} unavailable ({operation}): {errno}")]
    SegmentUnavailable {
        /// Segment name
        name: String,
        /// Failing system call
        operation: &'static str,
        /// Error reported by the kernel
        errno: Errno,
    },

    /// Release of a segment handle that is no longer attached
    #[error("Segment {name} is already detached")]
    AlreadyDetached {
        /// Segment name
        name: String,
    },

    /// Mapped region too small or misaligned for the requested view
    #[error("Segment {name} cannot hold {required} bytes aligned to {alignment} (mapped {mapped})")]
    SizeMismatch {
        /// Segment name
        name: String,
        /// Bytes needed by the view
        required: usize,
        /// Alignment needed by the view
        alignment: usize,
        /// Bytes actually mapped
        mapped: usize,
    },

    /// Shared table attached before the launcher initialized it
    #[error("Shared table {name} has not been initialized")]
    NotInitialized {
        /// Segment name
        name: String,
    },

    /// Caller passed an out-of-range operand
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Caller tried to release more than it holds
    #[error(
        "Slot {slot} tried to release {requested} of resource {resource} while holding {held}"
    )]
    OverRelease {
        /// Process slot
        slot: usize,
        /// Resource type
        resource: usize,
        /// Quantity asked to release
        requested: i32,
        /// Quantity currently allocated to the slot
        held: i32,
    },

    /// Message queue operation failed
    #[error("Message transport failure ({operation}): {errno}")]
    TransportFailure {
        /// Failing system call
        operation: &'static str,
        /// Error reported by the kernel
        errno: Errno,
    },

    /// Blocking receive abandoned because shutdown was requested
    #[error("Operation cancelled by shutdown request")]
    Cancelled,

    /// Named semaphore operation failed
    #[error("Semaphore {name} failure ({operation}): {errno}")]
    Semaphore {
        /// Semaphore name
        name: String,
        /// Failing call
        operation: &'static str,
        /// Error reported by the kernel
        errno: Errno,
    },

    /// In-segment mutex could not be initialized or acquired
    #[error("Lock failure on {name} ({operation}): {errno}")]
    Lock {
        /// Protected table
        name: String,
        /// Failing pthread call
        operation: &'static str,
        /// Error code returned by pthread
        errno: Errno,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl ShmError {
    /// Shorthand for [`ShmError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Kernel error number carried by the error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::KeyDerivation { errno, .. }
            | Self::SegmentUnavailable { errno, .. }
            | Self::TransportFailure { errno, .. }
            | Self::Semaphore { errno, .. }
            | Self::Lock { errno, .. } => Some(*errno),
            Self::Nix { source } => Some(*source),
            _ => None,
        }
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_exposed_for_kernel_failures() {
        let err = ShmError::TransportFailure {
            operation: "msgsnd",
            errno: Errno::EAGAIN,
        };
        assert_eq!(err.errno(), Some(Errno::EAGAIN));
        assert_eq!(ShmError::Cancelled.errno(), None);
    }

    #[test]
    fn over_release_message_names_operands() {
        let err = ShmError::OverRelease {
            slot: 3,
            resource: 1,
            requested: 5,
            held: 2,
        };
        let text = err.to_string();
        assert!(text.contains("Slot 3"));
        assert!(text.contains("release 5"));
        assert!(text.contains("holding 2"));
    }
}
