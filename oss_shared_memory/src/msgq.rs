//! System V message queue transport
//!
//! The queue is the system-wide channel between the coordinator and the
//! workers. Each message is a type discriminator plus a small fixed-size
//! payload; the kernel keeps messages FIFO per type.
//!
//! Blocking receives are cancellable: a signal interrupts the wait
//! (`EINTR`), the receive checks the [`ShutdownFlag`] and either returns
//! [`ShmError::Cancelled`] or goes back to waiting. An interrupted wait is
//! never reported as a transport failure.

use crate::error::{ShmError, ShmResult};
use crate::key::IpcKey;
use crate::signals::ShutdownFlag;
use bitflags::bitflags;
use nix::errno::Errno;
use std::mem::MaybeUninit;
use std::path::Path;
use std::ptr;

/// Plain-old-data payload carried by a [`Message`]
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` or primitive, contain no pointers, and
/// accept every bit pattern (including all zeros): the bytes come straight
/// from another process through the kernel. Their alignment must not exceed
/// `align_of::<c_long>()`, since the kernel copies the payload from directly
/// after the message type; larger alignments are rejected at compile time.
pub unsafe trait MessagePayload: Copy + Send + 'static {}

// SAFETY: primitive integers accept every bit pattern.
unsafe impl MessagePayload for i32 {}
// SAFETY: as above.
unsafe impl MessagePayload for u32 {}
// SAFETY: as above.
unsafe impl MessagePayload for i64 {}
// SAFETY: as above.
unsafe impl MessagePayload for u64 {}
// SAFETY: arrays of integers accept every bit pattern.
unsafe impl<const N: usize> MessagePayload for [i32; N] {}

/// A typed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<T: MessagePayload = i32> {
    /// Type / channel discriminator; must be positive when sending
    pub kind: i64,
    /// Payload
    pub payload: T,
}

impl<T: MessagePayload> Message<T> {
    /// Message of `kind` carrying `payload`
    pub fn new(kind: i64, payload: T) -> Self {
        Self { kind, payload }
    }
}

#[repr(C)]
struct Envelope<T> {
    mtype: libc::c_long,
    body: T,
}

impl<T: MessagePayload> Envelope<T> {
    /// Evaluated per payload type; padding after `mtype` would shift the body.
    const BODY_FOLLOWS_TYPE: () = assert!(
        std::mem::align_of::<T>() <= std::mem::align_of::<libc::c_long>(),
        "message payload is aligned more strictly than c_long"
    );
}

bitflags! {
    /// Flags for [`MessageQueue::receive`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecvFlags: libc::c_int {
        /// Fail with `ENOMSG` instead of blocking on an empty queue
        const NO_WAIT = libc::IPC_NOWAIT;
        /// Take the first message whose type differs from the requested one
        const EXCEPT = libc::MSG_EXCEPT;
        /// Truncate oversized messages instead of failing
        const NO_ERROR = libc::MSG_NOERROR;
    }
}

/// Handle on the system-wide message queue
#[derive(Debug)]
pub struct MessageQueue {
    key: IpcKey,
    id: libc::c_int,
}

impl MessageQueue {
    /// Create-or-attach the queue for `(path, project_id)`.
    pub fn open(path: impl AsRef<Path>, project_id: u8) -> ShmResult<Self> {
        let key = IpcKey::derive(path, project_id)?;
        Self::open_key(key)
    }

    /// Create-or-attach the queue for an already derived key.
    pub fn open_key(key: IpcKey) -> ShmResult<Self> {
        // SAFETY: plain syscall wrapper.
        let id = unsafe { libc::msgget(key.raw(), libc::IPC_CREAT | 0o666) };
        if id < 0 {
            let errno = Errno::last();
            tracing::error!("msgget failed for key {}: {}", key, errno);
            return Err(ShmError::TransportFailure {
                operation: "msgget",
                errno,
            });
        }
        tracing::debug!("Message queue initialized successfully (msqId {})", id);
        Ok(Self { key, id })
    }

    /// Kernel identifier
    pub fn id(&self) -> libc::c_int {
        self.id
    }

    /// Key the queue was opened with
    pub fn key(&self) -> &IpcKey {
        &self.key
    }

    /// Enqueue without blocking; a full or removed queue is an error.
    pub fn send<T: MessagePayload>(&self, msg: &Message<T>) -> ShmResult<()> {
        if msg.kind <= 0 {
            return Err(ShmError::invalid(format!(
                "message type {} must be positive",
                msg.kind
            )));
        }
        tracing::debug!(
            "[SEND] Attempting to send message. msqId: {}, Type: {}",
            self.id,
            msg.kind
        );

        let () = Envelope::<T>::BODY_FOLLOWS_TYPE;
        let envelope = Envelope {
            mtype: msg.kind as libc::c_long,
            body: msg.payload,
        };
        // SAFETY: `envelope` starts with the mtype long the kernel expects
        // and is followed by exactly size_of::<T>() payload bytes.
        let rc = unsafe {
            libc::msgsnd(
                self.id,
                ptr::addr_of!(envelope).cast(),
                std::mem::size_of::<T>(),
                libc::IPC_NOWAIT,
            )
        };
        if rc == -1 {
            let errno = Errno::last();
            tracing::error!(
                "[SEND] Error: Failed to send message. msqId: {}, Type: {}, Error: {} ({})",
                self.id,
                msg.kind,
                errno.desc(),
                errno as i32
            );
            return Err(ShmError::TransportFailure {
                operation: "msgsnd",
                errno,
            });
        }

        tracing::info!(
            "[SEND] Success: Message sent. msqId: {}, Type: {}",
            self.id,
            msg.kind
        );
        Ok(())
    }

    /// Dequeue the first message of `kind` (0 = any type; a negative value
    /// takes the lowest type not above its magnitude).
    ///
    /// Without [`RecvFlags::NO_WAIT`] the call blocks until a message
    /// arrives or a signal finds `shutdown` requested. With `NO_WAIT`, an
    /// empty queue is a [`ShmError::TransportFailure`] carrying `ENOMSG`;
    /// see [`MessageQueue::try_receive`] for the polling form.
    pub fn receive<T: MessagePayload>(
        &self,
        kind: i64,
        flags: RecvFlags,
        shutdown: &ShutdownFlag,
    ) -> ShmResult<Message<T>> {
        tracing::debug!(
            "[RECEIVE] Attempting to receive message. msqId: {}, Expected Type: {}, Flags: {:?}",
            self.id,
            kind,
            flags
        );

        loop {
            if shutdown.is_requested() {
                tracing::info!("[RECEIVE] Terminating due to shutdown request.");
                return Err(ShmError::Cancelled);
            }

            match self.receive_once::<T>(kind, flags) {
                Ok(msg) => {
                    tracing::info!(
                        "[RECEIVE] Success: Message received. msqId: {}, Type: {}",
                        self.id,
                        msg.kind
                    );
                    return Ok(msg);
                }
                Err(Errno::EINTR) => {
                    tracing::info!(
                        "[RECEIVE] Interrupted by signal, checking if should terminate."
                    );
                }
                Err(errno) => {
                    if !(errno == Errno::ENOMSG && flags.contains(RecvFlags::NO_WAIT)) {
                        tracing::error!(
                            "[RECEIVE] Error: Failed to receive message. msqId: {}, Expected Type: {}, Error: {} ({})",
                            self.id,
                            kind,
                            errno.desc(),
                            errno as i32
                        );
                    }
                    return Err(ShmError::TransportFailure {
                        operation: "msgrcv",
                        errno,
                    });
                }
            }
        }
    }

    /// Non-blocking receive; `Ok(None)` when no message of `kind` is queued.
    pub fn try_receive<T: MessagePayload>(&self, kind: i64) -> ShmResult<Option<Message<T>>> {
        loop {
            match self.receive_once::<T>(kind, RecvFlags::NO_WAIT) {
                Ok(msg) => return Ok(Some(msg)),
                Err(Errno::ENOMSG) => return Ok(None),
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(ShmError::TransportFailure {
                        operation: "msgrcv",
                        errno,
                    });
                }
            }
        }
    }

    /// Messages currently queued
    pub fn pending(&self) -> ShmResult<u64> {
        Ok(self.stat()?.msg_qnum as u64)
    }

    /// Remove the queue from the kernel; blocked receivers get `EIDRM`.
    pub fn remove(self) -> ShmResult<()> {
        remove_by_id(self.id)
    }

    /// Remove the queue for `(path, project_id)`; `Ok(false)` if none exists.
    pub fn remove_key(path: impl AsRef<Path>, project_id: u8) -> ShmResult<bool> {
        let key = IpcKey::derive(path, project_id)?;
        // SAFETY: plain syscall wrapper; no IPC_CREAT only looks up.
        let id = unsafe { libc::msgget(key.raw(), 0) };
        if id < 0 {
            return match Errno::last() {
                Errno::ENOENT => Ok(false),
                errno => Err(ShmError::TransportFailure {
                    operation: "msgget",
                    errno,
                }),
            };
        }
        remove_by_id(id)?;
        Ok(true)
    }

    fn receive_once<T: MessagePayload>(
        &self,
        kind: i64,
        flags: RecvFlags,
    ) -> Result<Message<T>, Errno> {
        let () = Envelope::<T>::BODY_FOLLOWS_TYPE;
        let mut envelope = MaybeUninit::<Envelope<T>>::zeroed();
        // SAFETY: the buffer holds the mtype long plus size_of::<T>() bytes.
        let rc = unsafe {
            libc::msgrcv(
                self.id,
                envelope.as_mut_ptr().cast(),
                std::mem::size_of::<T>(),
                kind as libc::c_long,
                flags.bits(),
            )
        };
        if rc == -1 {
            return Err(Errno::last());
        }
        // SAFETY: zero-initialized and `T` accepts any bit pattern.
        let envelope = unsafe { envelope.assume_init() };
        Ok(Message {
            kind: i64::from(envelope.mtype),
            payload: envelope.body,
        })
    }

    fn stat(&self) -> ShmResult<libc::msqid_ds> {
        // SAFETY: msqid_ds is plain old data.
        let mut ds: libc::msqid_ds = unsafe { std::mem::zeroed() };
        // SAFETY: `ds` is a valid out pointer for IPC_STAT.
        if unsafe { libc::msgctl(self.id, libc::IPC_STAT, &mut ds) } == -1 {
            return Err(ShmError::TransportFailure {
                operation: "msgctl(IPC_STAT)",
                errno: Errno::last(),
            });
        }
        Ok(ds)
    }
}

fn remove_by_id(id: libc::c_int) -> ShmResult<()> {
    // SAFETY: IPC_RMID ignores the buffer argument.
    if unsafe { libc::msgctl(id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
        let errno = Errno::last();
        tracing::error!("Failed to remove message queue {}: {}", id, errno);
        return Err(ShmError::TransportFailure {
            operation: "msgctl(IPC_RMID)",
            errno,
        });
    }
    tracing::info!("Removed message queue {}", id);
    Ok(())
}
