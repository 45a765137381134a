//! # OSS Shared State and Transport
//!
//! The inter-process layer of the OSS simulation. A launcher process creates
//! a handful of kernel objects, then the coordinator, the timekeeper and
//! every worker attach to the same objects by deriving the same keys from
//! the same configuration.
//!
//! ## Objects
//!
//! | Object            | Kernel primitive              | Module            |
//! |-------------------|-------------------------------|-------------------|
//! | Simulated clock   | System V shared memory        | [`clock`]         |
//! | Actual time       | System V shared memory        | [`clock`]         |
//! | Clock gate        | POSIX named semaphore         | [`clock`]         |
//! | Process table     | System V shared memory        | [`process_table`] |
//! | Resource ledger   | System V shared memory        | [`ledger`]        |
//! | Message channel   | System V message queue        | [`msgq`]          |
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   msgsnd/msgrcv   ┌──────────────┐
//! │ Coordinator  │◄─────────────────►│   Worker N   │
//! │  (launcher)  │                   │              │
//! └──────┬───────┘                   └──────┬───────┘
//!        │ initialize                        │ attach
//!        ▼                                   ▼
//! ┌─────────────────────────────────────────────────┐
//! │ Simulated Clock │ Actual Time │ Process Table │ │
//! │ Resource Table [robust pthread mutex | counts]  │
//! └─────────────────────────────────────────────────┘
//!        ▲ sem_wait/sem_post
//! ┌──────┴───────┐
//! │  Timekeeper  │
//! └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oss_common::prelude::*;
//! use oss_shared_memory::{Grant, SharedState};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ipc = IpcConfig::default();
//! let state = SharedState::attach(&ipc)?;
//!
//! if state.ledger.request(3, 2, 0)? == Grant::Granted {
//!     state.ledger.release(3, 2, 0)?;
//! }
//! state.detach()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every fallible call returns [`ShmResult`]. A denied ledger request is not
//! an error ([`Grant::Denied`]); a blocking receive abandoned because of a
//! shutdown request is [`ShmError::Cancelled`].
//!
//! ## Shutdown
//!
//! [`signals::install`] wires SIGINT/SIGTERM to a [`ShutdownFlag`]. Workers
//! exit straight from the handler; other roles poll the flag and wind down,
//! detaching their segments on the way out.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod context;
pub mod error;
pub mod key;
pub mod ledger;
pub mod logger;
pub mod msgq;
pub mod platform;
pub mod process_table;
pub mod segment;
pub mod signals;
pub mod state;

pub use clock::{ActualTime, ClockGuard, NamedSemaphore, SharedClock, SimulatedClock};
pub use context::{ChildCounter, SimContext};
pub use error::{ShmError, ShmResult};
pub use key::IpcKey;
pub use ledger::{Grant, Ledger, RESOURCE_TABLE_SIZE, ResourceCounts};
pub use msgq::{Message, MessagePayload, MessageQueue, RecvFlags};
pub use process_table::{PROCESS_TABLE_SIZE, Pcb, ProcessTable};
pub use segment::Segment;
pub use signals::ShutdownFlag;
pub use state::{SharedState, StateReport};
