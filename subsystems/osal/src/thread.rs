//! # Thread Registry
//!
//! Threads are created by the native kernel but must be registered here
//! before they use a primitive. The registry carries what the layer owns
//! about a thread: its name, its base priority plus any inheritance boosts,
//! and its notification flag word.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::{OsalError, OsalResult};
use crate::flags::{FlagGroup, FlagSpace, WaitOptions};
use crate::kernel::Core;
use crate::port::{lock, Port};
use crate::time::Timeout;
use crate::{Priority, ThreadId};

/// Snapshot of a registered thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Thread ID
    pub id: ThreadId,
    /// Thread name
    pub name: &'static str,
    /// Effective priority (base plus inheritance)
    pub priority: Priority,
    /// Priority the thread asked for
    pub base_priority: Priority,
}

#[derive(Debug)]
struct PriorityState {
    base: Priority,
    /// Inheritance boosts keyed by the mutex that applied them
    boosts: BTreeMap<u64, Priority>,
}

impl PriorityState {
    fn effective(&self) -> Priority {
        self.boosts
            .values()
            .copied()
            .fold(self.base, core::cmp::max)
    }
}

/// What the layer knows about one thread
#[derive(Debug)]
pub(crate) struct ThreadRecord {
    id: ThreadId,
    name: &'static str,
    priority: spin::Mutex<PriorityState>,
    pub(crate) notify: FlagGroup,
}

impl ThreadRecord {
    fn new(id: ThreadId, name: &'static str, base: Priority, notify: FlagSpace) -> Self {
        Self {
            id,
            name,
            priority: spin::Mutex::new(PriorityState {
                base,
                boosts: BTreeMap::new(),
            }),
            notify: FlagGroup::new(notify),
        }
    }

    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn effective_priority(&self, port: &dyn Port) -> Priority {
        lock(port, &self.priority).effective()
    }

    pub(crate) fn base_priority(&self, port: &dyn Port) -> Priority {
        lock(port, &self.priority).base
    }

    pub(crate) fn set_base(&self, port: &dyn Port, base: Priority) {
        self.update(port, |state| state.base = base);
    }

    /// Raise the effective priority on behalf of mutex `key`
    pub(crate) fn boost(&self, port: &dyn Port, key: u64, priority: Priority) {
        self.update(port, |state| {
            state.boosts.insert(key, priority);
        });
    }

    /// Drop the boost applied by mutex `key`
    pub(crate) fn unboost(&self, port: &dyn Port, key: u64) {
        self.update(port, |state| {
            state.boosts.remove(&key);
        });
    }

    fn update(&self, port: &dyn Port, f: impl FnOnce(&mut PriorityState)) {
        let (before, after) = {
            let mut state = lock(port, &self.priority);
            let before = state.effective();
            f(&mut state);
            (before, state.effective())
        };
        if before != after {
            log::debug!("{} priority {} -> {}", self.id, before, after);
            port.priority_changed(self.id, after);
        }
    }

    fn info(&self, port: &dyn Port) -> ThreadInfo {
        let state = lock(port, &self.priority);
        ThreadInfo {
            id: self.id,
            name: self.name,
            priority: state.effective(),
            base_priority: state.base,
        }
    }
}

/// All registered threads
#[derive(Debug)]
pub(crate) struct ThreadTable {
    threads: RwLock<BTreeMap<ThreadId, Arc<ThreadRecord>>>,
}

impl ThreadTable {
    pub(crate) const fn new() -> Self {
        Self {
            threads: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn get(&self, id: ThreadId) -> OsalResult<Arc<ThreadRecord>> {
        self.threads.read().get(&id).cloned().ok_or(OsalError::InvalidArg)
    }

    fn insert(&self, record: Arc<ThreadRecord>) -> OsalResult<()> {
        let mut threads = self.threads.write();
        if threads.contains_key(&record.id) {
            return Err(OsalError::Resource);
        }
        threads.insert(record.id, record);
        Ok(())
    }

    pub(crate) fn remove(&self, id: ThreadId) -> OsalResult<Arc<ThreadRecord>> {
        self.threads.write().remove(&id).ok_or(OsalError::InvalidArg)
    }

    pub(crate) fn count(&self) -> usize {
        self.threads.read().len()
    }

    fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.read().values().cloned().collect()
    }
}

/// Thread operations
#[derive(Debug, Clone)]
pub struct Threads {
    core: Arc<Core>,
}

impl Threads {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Register a natively created thread and return its layer ID
    pub fn register(&self, name: &'static str, priority: Priority) -> OsalResult<ThreadId> {
        if !priority.is_valid() {
            return Err(OsalError::InvalidArg);
        }
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let id = ThreadId::new();
        let space = FlagSpace::new(self.core.config.notify_flag_bits);
        self.core
            .threads
            .insert(Arc::new(ThreadRecord::new(id, name, priority, space)))?;
        log::info!("Registered {} '{}' at {}", id, name, priority);
        Ok(id)
    }

    /// Thread the caller runs as
    pub fn current(&self) -> OsalResult<ThreadId> {
        Ok(self.core.current()?.id())
    }

    /// Name given at registration
    pub fn get_name(&self, id: ThreadId) -> OsalResult<&'static str> {
        Ok(self.core.threads.get(id)?.name())
    }

    /// Effective priority, including inheritance boosts
    pub fn get_priority(&self, id: ThreadId) -> OsalResult<Priority> {
        Ok(self.core.threads.get(id)?.effective_priority(self.core.port()))
    }

    /// Priority set by registration or [`set_priority`](Self::set_priority)
    pub fn get_base_priority(&self, id: ThreadId) -> OsalResult<Priority> {
        Ok(self.core.threads.get(id)?.base_priority(self.core.port()))
    }

    /// Change the base priority; active boosts still apply on top
    pub fn set_priority(&self, id: ThreadId, priority: Priority) -> OsalResult<()> {
        if !priority.is_valid() {
            return Err(OsalError::InvalidArg);
        }
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        self.core.threads.get(id)?.set_base(self.core.port(), priority);
        Ok(())
    }

    /// Number of registered threads
    pub fn count(&self) -> usize {
        self.core.threads.count()
    }

    /// Snapshot of every registered thread, in ID order
    pub fn enumerate(&self) -> Vec<ThreadInfo> {
        let port = self.core.port();
        self.core
            .threads
            .snapshot()
            .iter()
            .map(|record| record.info(port))
            .collect()
    }

    /// Set notification flags of `id`. Legal from interrupt context.
    ///
    /// Returns the word after any waiter consumed its bits.
    pub fn notify_set(&self, id: ThreadId, flags: u32) -> OsalResult<u32> {
        self.notify_space().check(flags)?;
        let record = self.core.threads.get(id)?;
        record.notify.set(self.core.port(), flags)
    }

    /// Clear notification flags of the calling thread. Returns the word
    /// before clearing.
    pub fn notify_clear(&self, flags: u32) -> OsalResult<u32> {
        self.notify_space().check(flags)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        self.core.current()?.notify.clear(self.core.port(), flags)
    }

    /// Notification flags of the calling thread
    pub fn notify_get(&self) -> OsalResult<u32> {
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        Ok(self.core.current()?.notify.get(self.core.port()))
    }

    /// Wait on the calling thread's notification flags.
    ///
    /// Returns the word as seen when the wait was satisfied.
    pub fn notify_wait(
        &self,
        flags: u32,
        options: WaitOptions,
        timeout: impl Into<Timeout>,
    ) -> OsalResult<u32> {
        let flags = self.notify_space().check(flags)?;
        if flags == 0 {
            return Err(OsalError::InvalidArg);
        }
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let record = self.core.current()?;
        let caller = self.core.caller_of(&record);
        record
            .notify
            .wait(self.core.port(), caller, flags, options, timeout.into())
    }

    fn notify_space(&self) -> FlagSpace {
        FlagSpace::new(self.core.config.notify_flag_bits)
    }
}
