//! System V IPC key derivation
//!
//! Every process recomputes the same key from the same `(path, project id)`
//! pair instead of passing identifiers around. The key is a function of the
//! path's inode and device, so the path must exist and must not be replaced
//! while the simulation runs.

use crate::error::{ShmError, ShmResult};
use crate::platform::path_to_cstring;
use nix::errno::Errno;
use std::fmt;
use std::path::{Path, PathBuf};

/// A derived System V IPC key together with the inputs that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpcKey {
    path: PathBuf,
    project_id: u8,
    raw: libc::key_t,
}

impl IpcKey {
    /// Derive the key for `(path, project_id)` with `ftok`.
    ///
    /// A project id of 0 is rejected: `ftok` leaves its behaviour
    /// unspecified.
    pub fn derive(path: impl AsRef<Path>, project_id: u8) -> ShmResult<Self> {
        let path = path.as_ref();
        if project_id == 0 {
            return Err(ShmError::invalid("project id 0 is reserved"));
        }

        let c_path = path_to_cstring(path)?;
        // SAFETY: `c_path` is a valid NUL-terminated string for the call.
        let raw = unsafe { libc::ftok(c_path.as_ptr(), libc::c_int::from(project_id)) };
        if raw == -1 {
            let errno = Errno::last();
            tracing::error!(
                "ftok failed for {} proj_id {}: {}",
                path.display(),
                project_id,
                errno
            );
            return Err(ShmError::KeyDerivation {
                path: path.display().to_string(),
                project_id,
                errno,
            });
        }

        tracing::debug!(
            "ftok success for {} proj_id {}: key {:#x}",
            path.display(),
            project_id,
            raw
        );
        Ok(Self {
            path: path.to_path_buf(),
            project_id,
            raw,
        })
    }

    /// Raw key value for `shmget`/`msgget`
    pub fn raw(&self) -> libc::key_t {
        self.raw
    }

    /// Reference path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Project id
    pub fn project_id(&self) -> u8 {
        self.project_id
    }
}

impl fmt::Display for IpcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} ({}:{})",
            self.raw,
            self.path.display(),
            self.project_id
        )
    }
}
