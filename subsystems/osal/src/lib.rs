//! # Helix OSAL
//!
//! The OS abstraction layer gives application code one set of thread
//! synchronization primitives regardless of which real-time kernel
//! schedules the threads:
//! - Event flags and per-thread notification flags
//! - Mutexes (recursive, priority inheritance, robust)
//! - Counting semaphores
//! - Priority message queues
//! - Software timers
//!
//! ## Key Principle
//!
//! The state machines are written once, here. A backend only supplies the
//! [`Port`] capability: who is running, are we in an interrupt, what time
//! is it, and "park this thread until unparked or timed out". The layer
//! never decides which ready thread runs.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod event;
pub mod flags;
pub mod kernel;
pub mod mutex;
pub mod object;
pub mod port;
pub mod priority;
pub mod queue;
pub mod semaphore;
pub mod thread;
pub mod time;
pub mod timer;

mod wait;

#[cfg(test)]
mod mock;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub use config::OsalConfig;
pub use error::{OsalError, OsalResult};
pub use event::EventId;
pub use flags::WaitOptions;
pub use kernel::{KernelInfo, Osal};
pub use mutex::{MutexFlags, MutexId};
pub use object::{ControlBlock, Handle, MessageMemory, ObjectAttr};
pub use port::{CriticalState, Port, PortError};
pub use priority::Priority;
pub use queue::{QueueAttr, QueueId};
pub use semaphore::SemaphoreId;
pub use thread::{ThreadInfo, Threads};
pub use time::{Forever, NoWait, Timeout, WAIT_FOREVER};
pub use timer::{TimerId, TimerKind};
pub use wait::WaitOrder;

/// Unique identifier for threads known to the layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Allocate a fresh thread ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an ID from its raw value (as stored by a port)
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}
