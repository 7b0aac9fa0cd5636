//! # Port Capability
//!
//! The one seam between the kernel-agnostic core and a concrete RTOS.
//!
//! A port answers four questions and offers two services:
//! - which registered thread is running ([`Port::current_thread`])
//! - whether the caller is an interrupt handler ([`Port::in_isr`])
//! - what the tick counter reads ([`Port::tick_count`], [`Port::tick_freq`])
//! - how to fence a state update against interrupts
//!   ([`Port::enter_critical`] / [`Port::exit_critical`])
//! - how to suspend and resume a thread ([`Port::park`] / [`Port::unpark`])
//!
//! Two notifications flow back to the port: [`Port::priority_changed`] and
//! [`Port::thread_terminated`].
//!
//! Everything else (wait algebra, ownership, priority inheritance, queue
//! ordering) lives in this crate and is shared by every port.

use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::{Priority, ThreadId};

/// Opaque interrupt state saved by [`Port::enter_critical`]
pub type CriticalState = usize;

/// Errors a port can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// The calling context is not a thread registered with the port
    UnknownThread,
    /// The backend lacks this capability
    NotSupported,
    /// Backend-native status code
    Native(i32),
}

/// Backend capability interface
///
/// # Parking contract
///
/// `unpark` issued before the matching `park` must not be lost: the next
/// `park` of that thread returns immediately (a single-token latch, as
/// with `std::thread::park`). `park` may also return spuriously; callers
/// re-check their condition.
pub trait Port: Send + Sync {
    /// Backend name (for diagnostics)
    fn name(&self) -> &'static str;

    /// Thread on whose behalf the caller runs
    fn current_thread(&self) -> Result<ThreadId, PortError>;

    /// Is the caller an interrupt handler?
    fn in_isr(&self) -> bool;

    /// Monotonic tick counter
    fn tick_count(&self) -> u64;

    /// Tick frequency in Hz
    fn tick_freq(&self) -> u32;

    /// Mask interrupts (or take the kernel lock) and return the previous state
    fn enter_critical(&self) -> CriticalState;

    /// Restore the state returned by the matching `enter_critical`
    fn exit_critical(&self, state: CriticalState);

    /// Suspend `thread` (the caller) until unparked or `timeout` ticks pass.
    /// `None` waits without a deadline.
    fn park(&self, thread: ThreadId, timeout: Option<u64>);

    /// Make `thread` runnable again
    fn unpark(&self, thread: ThreadId);

    /// The effective priority of `thread` changed (inheritance boost or
    /// restore). Ports forward this to the native scheduler.
    fn priority_changed(&self, thread: ThreadId, effective: Priority);

    /// `thread` has left the layer; per-thread port state may be freed
    fn thread_terminated(&self, _thread: ThreadId) {}
}

/// RAII critical section
pub(crate) struct Critical<'a> {
    port: &'a dyn Port,
    state: CriticalState,
}

impl<'a> Critical<'a> {
    pub(crate) fn enter(port: &'a dyn Port) -> Self {
        let state = port.enter_critical();
        Self { port, state }
    }
}

impl Drop for Critical<'_> {
    fn drop(&mut self) {
        self.port.exit_critical(self.state);
    }
}

/// Primitive state locked inside a critical section
///
/// Field order matters: the spin guard is released before the critical
/// section is left.
pub(crate) struct Locked<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _critical: Critical<'a>,
}

impl<T> Deref for Locked<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Locked<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Lock primitive state the way every operation must
pub(crate) fn lock<'a, T>(port: &'a dyn Port, state: &'a spin::Mutex<T>) -> Locked<'a, T> {
    let critical = Critical::enter(port);
    Locked {
        guard: state.lock(),
        _critical: critical,
    }
}

impl fmt::Debug for dyn Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({})", self.name())
    }
}
