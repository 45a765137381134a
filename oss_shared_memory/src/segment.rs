//! System V shared memory segments
//!
//! A [`Segment`] is one process's attachment to a kernel shared memory
//! object identified by an [`IpcKey`]. Acquiring is create-or-attach, so the
//! first process to ask creates the region and everybody else maps the same
//! one. Detaching only affects the calling process; the region stays in the
//! kernel (content included) until [`Segment::remove`] or
//! [`Segment::mark_for_removal`] is called.

use crate::error::{ShmError, ShmResult};
use crate::key::IpcKey;
use nix::errno::Errno;
use std::path::Path;
use std::ptr::{self, NonNull};

/// Permission bits for every segment: shared by all simulation processes
pub const SEGMENT_MODE: libc::c_int = 0o666;

/// One process's attachment to a shared memory segment
#[derive(Debug)]
pub struct Segment {
    name: String,
    key: IpcKey,
    shm_id: libc::c_int,
    size: usize,
    addr: Option<NonNull<u8>>,
}

// SAFETY: the mapping belongs to the process, not to the creating thread.
// Concurrent access to the contents is governed by the typed wrappers.
unsafe impl Send for Segment {}

impl Segment {
    /// Create-or-attach the segment for `(path, project_id)` and map it.
    ///
    /// `name` is only used in diagnostics.
    pub fn acquire(
        name: &str,
        path: impl AsRef<Path>,
        project_id: u8,
        size: usize,
    ) -> ShmResult<Self> {
        let key = IpcKey::derive(path, project_id)?;
        Self::acquire_with_key(name, key, size)
    }

    /// Create-or-attach with an already derived key.
    pub fn acquire_with_key(name: &str, key: IpcKey, size: usize) -> ShmResult<Self> {
        if size == 0 {
            return Err(ShmError::invalid(format!("segment {name} needs a non-zero size")));
        }

        // SAFETY: plain syscall wrapper, no pointers involved.
        let shm_id = unsafe { libc::shmget(key.raw(), size, SEGMENT_MODE | libc::IPC_CREAT) };
        if shm_id < 0 {
            let errno = Errno::last();
            tracing::error!(
                "Failed to obtain shmId for {} (key {}, {} bytes): {}",
                name,
                key,
                size,
                errno
            );
            return Err(ShmError::SegmentUnavailable {
                name: name.to_string(),
                operation: "shmget",
                errno,
            });
        }

        // SAFETY: a null address lets the kernel choose the mapping.
        let raw = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if raw as isize == -1 {
            let errno = Errno::last();
            tracing::error!("Failed to attach to {} shared memory: {}", name, errno);
            return Err(ShmError::SegmentUnavailable {
                name: name.to_string(),
                operation: "shmat",
                errno,
            });
        }

        tracing::debug!(
            "Attached {} shared memory (shmid {}, key {}, {} bytes)",
            name,
            shm_id,
            key,
            size
        );

        Ok(Self {
            name: name.to_string(),
            key,
            shm_id,
            size,
            addr: NonNull::new(raw.cast::<u8>()),
        })
    }

    /// Detach the segment from the calling process.
    ///
    /// The handle is cleared on success, so a second call returns
    /// [`ShmError::AlreadyDetached`] instead of touching a stale mapping.
    pub fn release(&mut self) -> ShmResult<()> {
        let Some(addr) = self.addr else {
            tracing::error!("Invalid pointer for detaching {} shared memory.", self.name);
            return Err(ShmError::AlreadyDetached {
                name: self.name.clone(),
            });
        };

        // SAFETY: `addr` was returned by `shmat` and has not been detached.
        if unsafe { libc::shmdt(addr.as_ptr().cast()) } == -1 {
            let errno = Errno::last();
            tracing::error!("Detaching from {} shared memory failed: {}", self.name, errno);
            return Err(ShmError::SegmentUnavailable {
                name: self.name.clone(),
                operation: "shmdt",
                errno,
            });
        }

        self.addr = None;
        tracing::info!("Successfully detached from {} shared memory.", self.name);
        Ok(())
    }

    /// Whether the segment is still mapped in this process
    pub fn is_attached(&self) -> bool {
        self.addr.is_some()
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key the segment was acquired with
    pub fn key(&self) -> &IpcKey {
        &self.key
    }

    /// Kernel identifier
    pub fn shm_id(&self) -> libc::c_int {
        self.shm_id
    }

    /// Bytes requested at acquire time (the mapped usable size)
    pub fn size(&self) -> usize {
        self.size
    }

    /// Base address of the mapping
    pub fn as_ptr(&self) -> ShmResult<NonNull<u8>> {
        self.addr.ok_or_else(|| ShmError::AlreadyDetached {
            name: self.name.clone(),
        })
    }

    /// Mapped bytes
    pub fn as_slice(&self) -> ShmResult<&[u8]> {
        let base = self.as_ptr()?;
        // SAFETY: the mapping covers `size` bytes while attached.
        Ok(unsafe { std::slice::from_raw_parts(base.as_ptr(), self.size) })
    }

    /// Mapped bytes, writable
    ///
    /// Other processes may write concurrently; callers that need
    /// consistency must hold whatever lock guards this segment.
    pub fn as_mut_slice(&mut self) -> ShmResult<&mut [u8]> {
        let base = self.as_ptr()?;
        // SAFETY: the mapping covers `size` bytes while attached.
        Ok(unsafe { std::slice::from_raw_parts_mut(base.as_ptr(), self.size) })
    }

    /// Base address cast to `T`, checked against size and alignment.
    pub fn typed_ptr<T>(&self) -> ShmResult<NonNull<T>> {
        self.typed_array_ptr::<T>(1)
    }

    /// Base address of an array of `count` values of `T`.
    pub fn typed_array_ptr<T>(&self, count: usize) -> ShmResult<NonNull<T>> {
        let base = self.as_ptr()?;
        let required = std::mem::size_of::<T>().saturating_mul(count);
        let alignment = std::mem::align_of::<T>();
        if required > self.size || (base.as_ptr() as usize) % alignment != 0 {
            return Err(ShmError::SizeMismatch {
                name: self.name.clone(),
                required,
                alignment,
                mapped: self.size,
            });
        }
        Ok(base.cast::<T>())
    }

    /// Size of the kernel object, which may exceed [`Segment::size`] when
    /// an earlier run created it larger.
    pub fn kernel_size(&self) -> ShmResult<usize> {
        Ok(self.stat()?.shm_segsz)
    }

    /// Number of processes currently attached
    pub fn attach_count(&self) -> ShmResult<u64> {
        Ok(self.stat()?.shm_nattch as u64)
    }

    /// Schedule the kernel object for destruction once every process has
    /// detached. New acquires with the same key create a fresh region.
    pub fn mark_for_removal(&self) -> ShmResult<()> {
        remove_by_id(&self.name, self.shm_id)
    }

    /// Remove the segment for `(path, project_id)` from the kernel.
    ///
    /// Returns `Ok(false)` if no such segment exists.
    pub fn remove(name: &str, path: impl AsRef<Path>, project_id: u8) -> ShmResult<bool> {
        let key = IpcKey::derive(path, project_id)?;
        // SAFETY: plain syscall wrapper; size 0 and no flags only look up.
        let shm_id = unsafe { libc::shmget(key.raw(), 0, 0) };
        if shm_id < 0 {
            let errno = Errno::last();
            if errno == Errno::ENOENT {
                tracing::debug!("No {} shared memory to remove (key {})", name, key);
                return Ok(false);
            }
            return Err(ShmError::SegmentUnavailable {
                name: name.to_string(),
                operation: "shmget",
                errno,
            });
        }
        remove_by_id(name, shm_id)?;
        Ok(true)
    }

    fn stat(&self) -> ShmResult<libc::shmid_ds> {
        // SAFETY: shmid_ds is plain old data; zeroed is a valid value.
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        // SAFETY: `ds` is a valid out pointer for IPC_STAT.
        if unsafe { libc::shmctl(self.shm_id, libc::IPC_STAT, &mut ds) } == -1 {
            return Err(ShmError::SegmentUnavailable {
                name: self.name.clone(),
                operation: "shmctl(IPC_STAT)",
                errno: Errno::last(),
            });
        }
        Ok(ds)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Some(addr) = self.addr.take() {
            // SAFETY: `addr` came from `shmat` and was never detached.
            if unsafe { libc::shmdt(addr.as_ptr().cast()) } == -1 {
                tracing::warn!(
                    "Detaching {} shared memory on drop failed: {}",
                    self.name,
                    Errno::last()
                );
            }
        }
    }
}

fn remove_by_id(name: &str, shm_id: libc::c_int) -> ShmResult<()> {
    // SAFETY: IPC_RMID ignores the buffer argument.
    if unsafe { libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
        let errno = Errno::last();
        tracing::error!("Failed to remove {} shared memory: {}", name, errno);
        return Err(ShmError::SegmentUnavailable {
            name: name.to_string(),
            operation: "shmctl(IPC_RMID)",
            errno,
        });
    }
    tracing::info!("Removed {} shared memory (shmid {}).", name, shm_id);
    Ok(())
}
