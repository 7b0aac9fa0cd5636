//! # Mutex Engine
//!
//! Ownership tracking with optional recursion, priority inheritance and
//! robust release.
//!
//! ## State
//!
//! `lock_count > 0` exactly when an owner is recorded. When the count
//! drops to zero the mutex is handed straight to the next waiter (highest
//! priority first under `PRIO_INHERIT`, arrival order otherwise), so a
//! woken waiter already owns the lock when it resumes.
//!
//! ## Inheritance
//!
//! Under `PRIO_INHERIT` the owner carries a boost equal to the highest
//! waiter priority. The boost follows the waiter set and is removed when
//! the owner's `lock_count` returns to zero.
//!
//! Lock order: mutex state, then thread priority.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::error::{OsalError, OsalResult};
use crate::kernel::Core;
use crate::object::{Handle, ObjectAttr, ObjectTable};
use crate::port::lock;
use crate::time::{Deadline, Timeout};
use crate::wait::{block, settle_timeout, Wake, WaitOrder, WaitQueue};
use crate::ThreadId;

bitflags! {
    /// Mutex attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MutexFlags: u32 {
        /// The owner may lock again
        const RECURSIVE = 0x0000_0001;
        /// The owner inherits the priority of its waiters
        const PRIO_INHERIT = 0x0000_0002;
        /// Released automatically when the owner terminates
        const ROBUST = 0x0000_0008;
    }
}

/// Handle kind for mutexes
#[derive(Debug)]
pub enum Mutex {}

/// Mutex handle
pub type MutexId = Handle<Mutex>;

#[derive(Debug)]
struct MutexState {
    owner: Option<ThreadId>,
    lock_count: u32,
    waiters: WaitQueue<()>,
}

#[derive(Debug)]
struct MutexObject {
    /// Identifies this mutex's boost on the owner
    key: u64,
    name: Option<&'static str>,
    flags: MutexFlags,
    state: spin::Mutex<MutexState>,
}

impl MutexObject {
    fn inherits(&self) -> bool {
        self.flags.contains(MutexFlags::PRIO_INHERIT)
    }
}

/// Mutex operations
#[derive(Debug)]
pub struct Mutexes {
    core: Arc<Core>,
    table: ObjectTable<Mutex, MutexObject>,
}

impl Mutexes {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            table: ObjectTable::new(),
        }
    }

    /// Create a mutex; `attr.attr_bits` takes [`MutexFlags`]
    pub fn create(&self, attr: &ObjectAttr) -> OsalResult<MutexId> {
        attr.check_bits(MutexFlags::all().bits(), self.core.config.strict_attr_check)?;
        attr.cb_mem.validate(core::mem::size_of::<MutexObject>())?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }

        static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
        let flags = MutexFlags::from_bits_truncate(attr.attr_bits);
        let order = if flags.contains(MutexFlags::PRIO_INHERIT) {
            WaitOrder::Priority
        } else {
            WaitOrder::Fifo
        };
        let id = self.table.insert(MutexObject {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            name: attr.name,
            flags,
            state: spin::Mutex::new(MutexState {
                owner: None,
                lock_count: 0,
                waiters: WaitQueue::new(order),
            }),
        })?;
        log::debug!("Created mutex {:?} {:?} ({:?})", attr.name, flags, id);
        Ok(id)
    }

    /// Lock the mutex, blocking up to `timeout` while another thread owns it
    pub fn acquire(&self, id: MutexId, timeout: impl Into<Timeout>) -> OsalResult<()> {
        let timeout = timeout.into();
        let mutex = self.table.get(id)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let port = self.core.port();
        let record = self.core.current()?;
        let caller = self.core.caller_of(&record);
        let deadline = Deadline::after(port.tick_count(), timeout);

        loop {
            let slot = {
                let mut state = lock(port, &mutex.state);
                let owner = state.owner;
                match owner {
                    None => {
                        state.owner = Some(caller.thread);
                        state.lock_count = 1;
                        return Ok(());
                    }
                    Some(owner) if owner == caller.thread => {
                        if !mutex.flags.contains(MutexFlags::RECURSIVE) {
                            log::warn!("{} relocked non-recursive mutex {:?}", owner, mutex.name);
                            return Err(OsalError::Resource);
                        }
                        if state.lock_count >= self.core.config.recursive_lock_limit {
                            return Err(OsalError::Resource);
                        }
                        state.lock_count += 1;
                        return Ok(());
                    }
                    Some(_) => {
                        if timeout.is_no_wait() {
                            return Err(OsalError::Resource);
                        }
                        if deadline.expired(port.tick_count()) {
                            return Err(OsalError::Timeout);
                        }
                        let slot = state.waiters.push(caller, ());
                        self.refresh_boost(&mutex, &state);
                        slot
                    }
                }
            };

            let wake = match block(port, caller.thread, &slot, deadline) {
                Some(wake) => Some(wake),
                None => {
                    let mut state = lock(port, &mutex.state);
                    let wake = settle_timeout(&mut state.waiters, &slot);
                    if wake.is_none() {
                        self.refresh_boost(&mutex, &state);
                    }
                    wake
                }
            };
            match wake {
                // the releaser made us the owner
                Some(Wake::Granted(_)) => return Ok(()),
                Some(Wake::Deleted) => return Err(OsalError::Resource),
                Some(Wake::Retry) => continue,
                None => return Err(OsalError::Timeout),
            }
        }
    }

    /// Unlock once; at zero the next waiter becomes the owner
    pub fn release(&self, id: MutexId) -> OsalResult<()> {
        let mutex = self.table.get(id)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let thread = self.core.current()?.id();

        let mut state = lock(self.core.port(), &mutex.state);
        if state.owner != Some(thread) {
            return Err(OsalError::Resource);
        }
        state.lock_count -= 1;
        if state.lock_count == 0 {
            self.hand_over(&mutex, &mut state, thread);
        }
        Ok(())
    }

    /// Current owner, if locked. Legal from interrupt context.
    pub fn get_owner(&self, id: MutexId) -> OsalResult<Option<ThreadId>> {
        let mutex = self.table.get(id)?;
        let state = lock(self.core.port(), &mutex.state);
        Ok(state.owner)
    }

    /// Delete the mutex; blocked acquirers get `Resource`
    pub fn delete(&self, id: MutexId) -> OsalResult<()> {
        self.table.get(id)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let mutex = self.table.remove(id)?;
        let port = self.core.port();
        let mut state = lock(port, &mutex.state);
        if let Some(owner) = state.owner.take() {
            if mutex.inherits() {
                if let Ok(record) = self.core.threads.get(owner) {
                    record.unboost(port, mutex.key);
                }
            }
        }
        state.lock_count = 0;
        let woken = state.waiters.wake_all(port, Wake::Deleted);
        if woken > 0 {
            log::warn!("Deleted mutex {:?} with {} waiter(s)", mutex.name, woken);
        }
        Ok(())
    }

    /// Name given at creation
    pub fn get_name(&self, id: MutexId) -> OsalResult<Option<&'static str>> {
        Ok(self.table.get(id)?.name)
    }

    /// Number of live mutexes
    pub fn count(&self) -> usize {
        self.table.len()
    }

    /// Withdraw every acquire `thread` has pending, dropping the boost it
    /// lent each owner
    pub(crate) fn cancel_waits(&self, thread: ThreadId) -> usize {
        let port = self.core.port();
        let mut cancelled = 0;
        for (_, mutex) in self.table.snapshot() {
            let mut state = lock(port, &mutex.state);
            let n = state.waiters.cancel(port, thread);
            if n > 0 {
                self.refresh_boost(&mutex, &state);
                cancelled += n;
            }
        }
        cancelled
    }

    /// Force-release every robust mutex `thread` still holds.
    ///
    /// Non-robust mutexes stay locked. Returns how many were released.
    pub(crate) fn release_owned_by(&self, thread: ThreadId) -> usize {
        let port = self.core.port();
        let mut released = 0;
        for (_, mutex) in self.table.snapshot() {
            let mut state = lock(port, &mutex.state);
            if state.owner != Some(thread) {
                continue;
            }
            if !mutex.flags.contains(MutexFlags::ROBUST) {
                log::warn!("{} terminated holding mutex {:?}", thread, mutex.name);
                continue;
            }
            log::info!(
                "Robust release of {:?} from {} (count {})",
                mutex.name,
                thread,
                state.lock_count
            );
            state.lock_count = 0;
            self.hand_over(&mutex, &mut state, thread);
            released += 1;
        }
        released
    }

    /// Pass a fully released mutex to the next waiter, or free it
    fn hand_over(&self, mutex: &MutexObject, state: &mut MutexState, previous: ThreadId) {
        let port = self.core.port();
        if mutex.inherits() {
            if let Ok(record) = self.core.threads.get(previous) {
                record.unboost(port, mutex.key);
            }
        }
        match state.waiters.pop_front() {
            Some(waiter) => {
                log::trace!("mutex {:?} handed {} -> {}", mutex.name, previous, waiter.thread);
                state.owner = Some(waiter.thread);
                state.lock_count = 1;
                waiter.wake(port, Wake::Granted(1));
                self.refresh_boost(mutex, state);
            }
            None => {
                state.owner = None;
                state.lock_count = 0;
            }
        }
    }

    /// Bring the owner's boost in line with the current waiters
    fn refresh_boost(&self, mutex: &MutexObject, state: &MutexState) {
        if !mutex.inherits() {
            return;
        }
        let Some(owner) = state.owner else {
            return;
        };
        let Ok(record) = self.core.threads.get(owner) else {
            return;
        };
        let port = self.core.port();
        match state.waiters.top_priority() {
            Some(top) => record.boost(port, mutex.key, top),
            None => record.unboost(port, mutex.key),
        }
    }
}
