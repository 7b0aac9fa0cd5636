//! # Priority Message Queue
//!
//! Fixed-capacity store of fixed-size messages. Each message carries a
//! priority tag (0-255, larger is more urgent); `get` returns the most
//! urgent message, oldest first among equals.
//!
//! Message bytes live in `msg_count` slots of `msg_size` bytes, either
//! owned by the queue or supplied by the caller. Ordering is kept apart
//! from the bytes in [`PriorityBuckets`]: one FIFO of slot indices per
//! priority level, so equal priorities can never be reordered.
//!
//! Blocked putters and getters are woken to re-check the queue, never
//! handed a result, so `reset` and competing callers are observed as they
//! are.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{OsalError, OsalResult};
use crate::kernel::Core;
use crate::object::{ControlBlock, Handle, MessageMemory, ObjectTable};
use crate::port::{lock, Port};
use crate::time::{Deadline, Timeout};
use crate::wait::{block, settle_timeout, Caller, Wake, WaitOrder, WaitQueue};
use crate::ThreadId;

/// Handle kind for message queues
#[derive(Debug)]
pub enum MessageQueue {}

/// Message queue handle
pub type QueueId = Handle<MessageQueue>;

/// Creation attributes of a message queue
#[derive(Debug, Default)]
pub struct QueueAttr {
    /// Human-readable name
    pub name: Option<&'static str>,
    /// Reserved, must be zero
    pub attr_bits: u32,
    /// Control block memory
    pub cb_mem: ControlBlock,
    /// Message data memory
    pub mq_mem: MessageMemory,
}

impl QueueAttr {
    /// Attributes with just a name
    pub fn named(name: &'static str) -> Self {
        Self {
            name: Some(name),
            ..Self::default()
        }
    }
}

/// Slot indices grouped by message priority
#[derive(Debug, Default)]
pub(crate) struct PriorityBuckets {
    buckets: BTreeMap<u8, VecDeque<u32>>,
    len: usize,
}

impl PriorityBuckets {
    /// Queue `slot` behind every message of the same priority
    pub(crate) fn push(&mut self, priority: u8, slot: u32) {
        self.buckets.entry(priority).or_default().push_back(slot);
        self.len += 1;
    }

    /// Oldest slot of the highest priority
    pub(crate) fn pop(&mut self) -> Option<(u8, u32)> {
        let mut entry = self.buckets.last_entry()?;
        let priority = *entry.key();
        let slot = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        let slot = slot?;
        self.len -= 1;
        Some((priority, slot))
    }

    /// Empty every bucket, returning the slots that were queued
    pub(crate) fn drain(&mut self) -> Vec<u32> {
        let slots = core::mem::take(&mut self.buckets)
            .into_values()
            .flatten()
            .collect();
        self.len = 0;
        slots
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[derive(Debug)]
enum Storage {
    Owned(Vec<u8>),
    Borrowed(&'static mut [u8]),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(buf) => buf,
            Storage::Borrowed(buf) => buf,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(buf) => buf,
            Storage::Borrowed(buf) => buf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Put,
    Get,
}

#[derive(Debug)]
struct QueueState {
    storage: Storage,
    free: Vec<u32>,
    ready: PriorityBuckets,
    putters: WaitQueue<()>,
    getters: WaitQueue<()>,
}

impl QueueState {
    fn try_put(&mut self, msg: &[u8], priority: u8, msg_size: usize) -> Option<()> {
        let slot = self.free.pop()?;
        let start = slot as usize * msg_size;
        self.storage.bytes_mut()[start..start + msg_size].copy_from_slice(&msg[..msg_size]);
        self.ready.push(priority, slot);
        Some(())
    }

    fn try_get(&mut self, buf: &mut [u8], msg_size: usize) -> Option<u8> {
        let (priority, slot) = self.ready.pop()?;
        let start = slot as usize * msg_size;
        buf[..msg_size].copy_from_slice(&self.storage.bytes()[start..start + msg_size]);
        self.free.push(slot);
        Some(priority)
    }

    fn waiters(&mut self, side: Side) -> &mut WaitQueue<()> {
        match side {
            Side::Put => &mut self.putters,
            Side::Get => &mut self.getters,
        }
    }

    /// A put made a message available, a get made a slot available
    fn notify_other(&mut self, port: &dyn Port, side: Side) {
        let other = match side {
            Side::Put => Side::Get,
            Side::Get => Side::Put,
        };
        self.waiters(other).wake_one(port, Wake::Retry);
    }
}

#[derive(Debug)]
struct QueueObject {
    name: Option<&'static str>,
    msg_count: u32,
    msg_size: usize,
    state: spin::Mutex<QueueState>,
}

/// Message queue operations
#[derive(Debug)]
pub struct Queues {
    core: Arc<Core>,
    table: ObjectTable<MessageQueue, QueueObject>,
}

impl Queues {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            table: ObjectTable::new(),
        }
    }

    /// Create a queue of `msg_count` messages of `msg_size` bytes
    pub fn create(&self, msg_count: u32, msg_size: usize, attr: QueueAttr) -> OsalResult<QueueId> {
        if msg_count == 0 || msg_size == 0 || msg_size > self.core.config.max_queue_msg_size {
            return Err(OsalError::InvalidArg);
        }
        let total = (msg_count as usize)
            .checked_mul(msg_size)
            .ok_or(OsalError::InvalidArg)?;
        if self.core.config.strict_attr_check && attr.attr_bits != 0 {
            return Err(OsalError::InvalidArg);
        }
        attr.cb_mem.validate(core::mem::size_of::<QueueObject>())?;
        if let MessageMemory::Static(buf) = &attr.mq_mem {
            if buf.len() < total {
                return Err(OsalError::InvalidArg);
            }
        }
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }

        let storage = match attr.mq_mem {
            MessageMemory::Dynamic => Storage::Owned(vec![0; total]),
            MessageMemory::Static(buf) => Storage::Borrowed(buf),
        };
        let id = self.table.insert(QueueObject {
            name: attr.name,
            msg_count,
            msg_size,
            state: spin::Mutex::new(QueueState {
                storage,
                free: (0..msg_count).rev().collect(),
                ready: PriorityBuckets::default(),
                putters: WaitQueue::new(WaitOrder::Fifo),
                getters: WaitQueue::new(WaitOrder::Fifo),
            }),
        })?;
        log::debug!(
            "Created queue {:?} {}x{}B ({:?})",
            attr.name,
            msg_count,
            msg_size,
            id
        );
        Ok(id)
    }

    /// Copy the first `msg_size` bytes of `msg` in with `priority`,
    /// blocking up to `timeout` while the queue is full. A zero timeout
    /// may run from interrupt context.
    pub fn put(
        &self,
        id: QueueId,
        msg: &[u8],
        priority: u8,
        timeout: impl Into<Timeout>,
    ) -> OsalResult<()> {
        let queue = self.table.get(id)?;
        if msg.len() < queue.msg_size {
            return Err(OsalError::InvalidArg);
        }
        let msg_size = queue.msg_size;
        self.transfer(&queue, timeout.into(), Side::Put, |state| {
            state.try_put(msg, priority, msg_size)
        })
    }

    /// Take the most urgent message into `buf` and return its priority,
    /// blocking up to `timeout` while the queue is empty. A zero timeout
    /// may run from interrupt context.
    pub fn get(&self, id: QueueId, buf: &mut [u8], timeout: impl Into<Timeout>) -> OsalResult<u8> {
        let queue = self.table.get(id)?;
        if buf.len() < queue.msg_size {
            return Err(OsalError::InvalidArg);
        }
        let msg_size = queue.msg_size;
        self.transfer(&queue, timeout.into(), Side::Get, |state| {
            state.try_get(buf, msg_size)
        })
    }

    fn transfer<T>(
        &self,
        queue: &QueueObject,
        timeout: Timeout,
        side: Side,
        mut attempt: impl FnMut(&mut QueueState) -> Option<T>,
    ) -> OsalResult<T> {
        if !timeout.is_no_wait() && self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let port = self.core.port();
        let deadline = Deadline::after(port.tick_count(), timeout);
        let mut caller: Option<Caller> = None;

        loop {
            let (slot, waiter) = {
                let mut state = lock(port, &queue.state);
                if let Some(done) = attempt(&mut *state) {
                    state.notify_other(port, side);
                    return Ok(done);
                }
                if timeout.is_no_wait() {
                    return Err(OsalError::Resource);
                }
                if deadline.expired(port.tick_count()) {
                    return Err(OsalError::Timeout);
                }
                let waiter = match caller {
                    Some(waiter) => waiter,
                    None => *caller.insert(self.core.caller()?),
                };
                (state.waiters(side).push(waiter, ()), waiter)
            };

            let wake = match block(port, waiter.thread, &slot, deadline) {
                Some(wake) => Some(wake),
                None => settle_timeout(lock(port, &queue.state).waiters(side), &slot),
            };
            match wake {
                Some(Wake::Deleted) => return Err(OsalError::Resource),
                Some(Wake::Retry) | Some(Wake::Granted(_)) => continue,
                None => return Err(OsalError::Timeout),
            }
        }
    }

    /// Messages currently queued. Legal from interrupt context.
    pub fn get_count(&self, id: QueueId) -> OsalResult<u32> {
        let queue = self.table.get(id)?;
        let count = lock(self.core.port(), &queue.state).ready.len();
        Ok(count as u32)
    }

    /// Free slots. Legal from interrupt context.
    pub fn get_space(&self, id: QueueId) -> OsalResult<u32> {
        let queue = self.table.get(id)?;
        let space = lock(self.core.port(), &queue.state).free.len();
        Ok(space as u32)
    }

    /// Slot count fixed at creation
    pub fn get_capacity(&self, id: QueueId) -> OsalResult<u32> {
        Ok(self.table.get(id)?.msg_count)
    }

    /// Message size fixed at creation
    pub fn get_msg_size(&self, id: QueueId) -> OsalResult<usize> {
        Ok(self.table.get(id)?.msg_size)
    }

    /// Discard every queued message. Blocked putters re-check the queue;
    /// blocked getters keep waiting.
    pub fn reset(&self, id: QueueId) -> OsalResult<()> {
        let queue = self.table.get(id)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let port = self.core.port();
        let mut state = lock(port, &queue.state);
        let discarded = state.ready.drain();
        log::debug!("Reset queue {:?}, {} message(s) dropped", queue.name, discarded.len());
        state.free.extend(discarded);
        state.putters.wake_all(port, Wake::Retry);
        Ok(())
    }

    /// Delete the queue; blocked putters and getters get `Resource`
    pub fn delete(&self, id: QueueId) -> OsalResult<()> {
        self.table.get(id)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let queue = self.table.remove(id)?;
        let port = self.core.port();
        let mut state = lock(port, &queue.state);
        let woken = state.putters.wake_all(port, Wake::Deleted)
            + state.getters.wake_all(port, Wake::Deleted);
        if woken > 0 {
            log::warn!("Deleted queue {:?} with {} waiter(s)", queue.name, woken);
        }
        Ok(())
    }

    /// Withdraw every put and get `thread` has pending
    pub(crate) fn cancel_waits(&self, thread: ThreadId) -> usize {
        let port = self.core.port();
        let mut cancelled = 0;
        for (_, queue) in self.table.snapshot() {
            let mut state = lock(port, &queue.state);
            cancelled += state.putters.cancel(port, thread) + state.getters.cancel(port, thread);
        }
        cancelled
    }

    /// Name given at creation
    pub fn get_name(&self, id: QueueId) -> OsalResult<Option<&'static str>> {
        Ok(self.table.get(id)?.name)
    }

    /// Number of live queues
    pub fn count(&self) -> usize {
        self.table.len()
    }
}
