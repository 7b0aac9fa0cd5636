//! # Event Flags
//!
//! Shared flag words any thread may set, clear and wait on. `set`, `clear`
//! and `get` are legal from interrupt context, as is a `wait` that does not
//! block.

use alloc::sync::Arc;

use crate::error::{OsalError, OsalResult};
use crate::flags::{FlagGroup, FlagSpace, WaitOptions};
use crate::kernel::Core;
use crate::object::{Handle, ObjectAttr, ObjectTable};
use crate::time::Timeout;
use crate::ThreadId;

/// Handle kind for event flag objects
#[derive(Debug)]
pub enum EventFlags {}

/// Event flags handle
pub type EventId = Handle<EventFlags>;

#[derive(Debug)]
struct EventObject {
    name: Option<&'static str>,
    flags: FlagGroup,
}

/// Event flag operations
#[derive(Debug)]
pub struct EventGroups {
    core: Arc<Core>,
    table: ObjectTable<EventFlags, EventObject>,
}

impl EventGroups {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            table: ObjectTable::new(),
        }
    }

    fn space(&self) -> FlagSpace {
        FlagSpace::new(self.core.config.event_flag_bits)
    }

    /// Create an event flags object with every flag clear
    pub fn create(&self, attr: &ObjectAttr) -> OsalResult<EventId> {
        attr.check_bits(0, self.core.config.strict_attr_check)?;
        attr.cb_mem.validate(core::mem::size_of::<EventObject>())?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let id = self.table.insert(EventObject {
            name: attr.name,
            flags: FlagGroup::new(self.space()),
        })?;
        log::debug!("Created event flags {:?} ({:?})", attr.name, id);
        Ok(id)
    }

    /// Set flags; returns the word after woken waiters consumed theirs
    pub fn set(&self, id: EventId, flags: u32) -> OsalResult<u32> {
        self.space().check(flags)?;
        self.table.get(id)?.flags.set(self.core.port(), flags)
    }

    /// Clear flags; returns the word before clearing
    pub fn clear(&self, id: EventId, flags: u32) -> OsalResult<u32> {
        self.space().check(flags)?;
        self.table.get(id)?.flags.clear(self.core.port(), flags)
    }

    /// Current flag word
    pub fn get(&self, id: EventId) -> OsalResult<u32> {
        Ok(self.table.get(id)?.flags.get(self.core.port()))
    }

    /// Wait for flags.
    ///
    /// Returns the word as seen when the wait was satisfied. A zero timeout
    /// polls and may run from interrupt context.
    pub fn wait(
        &self,
        id: EventId,
        flags: u32,
        options: WaitOptions,
        timeout: impl Into<Timeout>,
    ) -> OsalResult<u32> {
        let timeout = timeout.into();
        let flags = self.space().check(flags)?;
        if flags == 0 {
            return Err(OsalError::InvalidArg);
        }
        let event = self.table.get(id)?;
        if timeout.is_no_wait() {
            return event.flags.poll(self.core.port(), flags, options);
        }
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let caller = self.core.caller()?;
        event
            .flags
            .wait(self.core.port(), caller, flags, options, timeout)
    }

    /// Delete the object; blocked waiters get `Resource`
    pub fn delete(&self, id: EventId) -> OsalResult<()> {
        self.table.get(id)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let event = self.table.remove(id)?;
        let woken = event.flags.close(self.core.port());
        if woken > 0 {
            log::warn!("Deleted event flags {:?} with {} waiter(s)", event.name, woken);
        }
        Ok(())
    }

    /// Withdraw every wait `thread` has pending on an event object
    pub(crate) fn cancel_waits(&self, thread: ThreadId) -> usize {
        self.table
            .snapshot()
            .iter()
            .map(|(_, event)| event.flags.cancel(self.core.port(), thread))
            .sum()
    }

    /// Name given at creation
    pub fn get_name(&self, id: EventId) -> OsalResult<Option<&'static str>> {
        Ok(self.table.get(id)?.name)
    }

    /// Number of live event flag objects
    pub fn count(&self) -> usize {
        self.table.len()
    }
}
