//! # Wait Queues
//!
//! Blocked callers of every primitive sit in a [`WaitQueue`]. A waker
//! decides the outcome for a waiter while holding the primitive's lock,
//! writes it into the waiter's [`WaitSlot`], removes the waiter, and then
//! unparks the thread. The waiter reads its slot after resuming, so the
//! wake decision and any state change it implies (flags cleared,
//! ownership transferred, token consumed) are atomic with respect to
//! every other caller.
//!
//! A waiter's priority is captured when it queues. Changing the priority of
//! a thread that is already blocked (`set_priority`, or a boost it gains
//! from a mutex it owns) does not move it within a priority-ordered queue,
//! and does not change the boost it lends that mutex's owner. The new
//! priority takes effect at its next wait.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::port::Port;
use crate::time::Deadline;
use crate::{Priority, ThreadId};

/// Order in which a wait queue serves its waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOrder {
    /// Arrival order
    Fifo,
    /// Highest priority first, arrival order among equals
    Priority,
}

/// Outcome handed to a blocked waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The wait succeeded; the payload is primitive-specific
    Granted(u32),
    /// State changed; re-evaluate the condition
    Retry,
    /// The primitive was deleted
    Deleted,
}

/// Per-waiter mailbox for the wake outcome
#[derive(Debug)]
pub(crate) struct WaitSlot {
    wake: spin::Mutex<Option<Wake>>,
}

impl WaitSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            wake: spin::Mutex::new(None),
        })
    }

    fn signal(&self, wake: Wake) {
        *self.wake.lock() = Some(wake);
    }

    pub(crate) fn take(&self) -> Option<Wake> {
        self.wake.lock().take()
    }
}

/// The identity a blocking caller waits under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Caller {
    pub(crate) thread: ThreadId,
    pub(crate) priority: Priority,
}

/// A blocked thread and what it waits for
#[derive(Debug)]
pub(crate) struct Waiter<R> {
    pub(crate) thread: ThreadId,
    pub(crate) priority: Priority,
    pub(crate) request: R,
    slot: Arc<WaitSlot>,
}

impl<R> Waiter<R> {
    /// Hand the outcome to the waiter and resume it
    pub(crate) fn wake(self, port: &dyn Port, wake: Wake) {
        self.slot.signal(wake);
        port.unpark(self.thread);
    }
}

/// Ordered collection of blocked threads
#[derive(Debug)]
pub(crate) struct WaitQueue<R> {
    waiters: VecDeque<Waiter<R>>,
    order: WaitOrder,
}

impl<R> WaitQueue<R> {
    pub(crate) fn new(order: WaitOrder) -> Self {
        Self {
            waiters: VecDeque::new(),
            order,
        }
    }

    /// Enqueue a caller; returns the slot it will be woken through
    pub(crate) fn push(&mut self, caller: Caller, request: R) -> Arc<WaitSlot> {
        let slot = WaitSlot::new();
        let waiter = Waiter {
            thread: caller.thread,
            priority: caller.priority,
            request,
            slot: slot.clone(),
        };
        match self.order {
            WaitOrder::Fifo => self.waiters.push_back(waiter),
            WaitOrder::Priority => {
                // after every waiter of equal or higher priority
                let pos = self
                    .waiters
                    .iter()
                    .position(|w| w.priority < caller.priority)
                    .unwrap_or(self.waiters.len());
                self.waiters.insert(pos, waiter);
            }
        }
        slot
    }

    /// Remove the waiter owning `slot`; false if a waker already took it
    pub(crate) fn remove(&mut self, slot: &Arc<WaitSlot>) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(&w.slot, slot)) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<Waiter<R>> {
        self.waiters.pop_front()
    }

    /// Remove and return the waiter at `index`
    pub(crate) fn take(&mut self, index: usize) -> Option<Waiter<R>> {
        self.waiters.remove(index)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Waiter<R>> {
        self.waiters.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Highest priority among the waiters
    pub(crate) fn top_priority(&self) -> Option<Priority> {
        self.waiters.iter().map(|w| w.priority).max()
    }

    /// Wake the first waiter with `wake`
    pub(crate) fn wake_one(&mut self, port: &dyn Port, wake: Wake) -> bool {
        match self.waiters.pop_front() {
            Some(waiter) => {
                waiter.wake(port, wake);
                true
            }
            None => false,
        }
    }

    /// Drop every entry of `thread`, waking each with `Deleted`
    pub(crate) fn cancel(&mut self, port: &dyn Port, thread: ThreadId) -> usize {
        let mut cancelled = 0;
        let mut index = 0;
        while index < self.waiters.len() {
            if self.waiters[index].thread != thread {
                index += 1;
                continue;
            }
            if let Some(waiter) = self.waiters.remove(index) {
                waiter.wake(port, Wake::Deleted);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Wake every waiter with `wake`; returns how many there were
    pub(crate) fn wake_all(&mut self, port: &dyn Port, wake: Wake) -> usize {
        let count = self.waiters.len();
        while let Some(waiter) = self.waiters.pop_front() {
            waiter.wake(port, wake);
        }
        count
    }
}

/// Park the caller until its slot is filled or the deadline passes.
///
/// Returns `None` on timeout. The caller must then re-lock the primitive
/// and call [`settle_timeout`]: a waker may have filled the slot between
/// the deadline and the re-lock.
pub(crate) fn block(
    port: &dyn Port,
    thread: ThreadId,
    slot: &WaitSlot,
    deadline: Deadline,
) -> Option<Wake> {
    loop {
        if let Some(wake) = slot.take() {
            return Some(wake);
        }
        let remaining = deadline.remaining(port.tick_count());
        if remaining == Some(0) {
            return None;
        }
        log::trace!("{} parks ({:?} ticks left)", thread, remaining);
        port.park(thread, remaining);
    }
}

/// Resolve a timed-out wait under the primitive's lock.
///
/// `None` means the timeout stands and the waiter has been dequeued;
/// `Some` is the outcome a waker decided before the waiter could leave.
pub(crate) fn settle_timeout<R>(queue: &mut WaitQueue<R>, slot: &Arc<WaitSlot>) -> Option<Wake> {
    if queue.remove(slot) {
        None
    } else {
        slot.take()
    }
}
