//! # Software Timers
//!
//! One-shot and periodic callbacks driven by the tick counter. The layer
//! keeps the schedule; whoever plays timer service (a port thread, a tick
//! hook) calls [`Timers::service`] to run the callbacks that are due.
//!
//! A periodic timer re-arms from its previous expiry, not from the moment
//! the service ran, so a late service does not stretch the period.
//!
//! Lock order: schedule, then timer state. Callbacks run with no layer
//! lock held.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use crate::error::{OsalError, OsalResult};
use crate::kernel::Core;
use crate::object::{Handle, ObjectAttr, ObjectTable};
use crate::port::lock;

/// Firing behaviour of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fire once per start
    Once,
    /// Fire every period until stopped
    Periodic,
}

/// Handle kind for timers
#[derive(Debug)]
pub enum Timer {}

/// Timer handle
pub type TimerId = Handle<Timer>;

/// Timer callback; arguments are captured by the closure
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Schedule key: expiry tick, then start order
type Slot = (u64, u64);

#[derive(Debug, Default)]
struct TimerState {
    period: u32,
    armed: Option<Slot>,
}

struct TimerObject {
    name: Option<&'static str>,
    kind: TimerKind,
    callback: spin::Mutex<TimerCallback>,
    state: spin::Mutex<TimerState>,
}

impl fmt::Debug for TimerObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerObject")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Schedule {
    due: BTreeMap<Slot, TimerId>,
    seq: u64,
}

impl Schedule {
    fn arm(&mut self, at: u64, id: TimerId) -> Slot {
        let slot = (at, self.seq);
        self.seq += 1;
        self.due.insert(slot, id);
        slot
    }

    /// Remove the earliest entry due at `now`
    fn pop_due(&mut self, now: u64) -> Option<(Slot, TimerId)> {
        let entry = self.due.first_entry()?;
        if entry.key().0 > now {
            return None;
        }
        let slot = *entry.key();
        Some((slot, entry.remove()))
    }
}

/// Timer operations
#[derive(Debug)]
pub struct Timers {
    core: Arc<Core>,
    table: ObjectTable<Timer, TimerObject>,
    schedule: spin::Mutex<Schedule>,
}

impl Timers {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            table: ObjectTable::new(),
            schedule: spin::Mutex::new(Schedule::default()),
        }
    }

    /// Create a stopped timer
    pub fn create<F>(&self, callback: F, kind: TimerKind, attr: &ObjectAttr) -> OsalResult<TimerId>
    where
        F: FnMut() + Send + 'static,
    {
        attr.check_bits(0, self.core.config.strict_attr_check)?;
        attr.cb_mem.validate(core::mem::size_of::<TimerObject>())?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let id = self.table.insert(TimerObject {
            name: attr.name,
            kind,
            callback: spin::Mutex::new(Box::new(callback)),
            state: spin::Mutex::new(TimerState::default()),
        })?;
        log::debug!("Created {:?} timer {:?} ({:?})", kind, attr.name, id);
        Ok(id)
    }

    /// Arm the timer to fire `ticks` from now, restarting it if running
    pub fn start(&self, id: TimerId, ticks: u32) -> OsalResult<()> {
        let timer = self.table.get(id)?;
        if ticks == 0 {
            return Err(OsalError::InvalidArg);
        }
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let port = self.core.port();
        let mut schedule = lock(port, &self.schedule);
        let mut state = timer.state.lock();
        if let Some(old) = state.armed.take() {
            schedule.due.remove(&old);
        }
        let at = port.tick_count().saturating_add(ticks as u64);
        state.armed = Some(schedule.arm(at, id));
        state.period = ticks;
        Ok(())
    }

    /// Disarm a running timer
    pub fn stop(&self, id: TimerId) -> OsalResult<()> {
        let timer = self.table.get(id)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let mut schedule = lock(self.core.port(), &self.schedule);
        let mut state = timer.state.lock();
        let slot = state.armed.take().ok_or(OsalError::Resource)?;
        schedule.due.remove(&slot);
        Ok(())
    }

    /// Is the timer armed? Legal from interrupt context.
    pub fn is_running(&self, id: TimerId) -> OsalResult<bool> {
        let timer = self.table.get(id)?;
        let running = lock(self.core.port(), &timer.state).armed.is_some();
        Ok(running)
    }

    /// Delete the timer, disarming it first
    pub fn delete(&self, id: TimerId) -> OsalResult<()> {
        self.table.get(id)?;
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let mut schedule = lock(self.core.port(), &self.schedule);
        let timer = self.table.remove(id)?;
        if let Some(slot) = timer.state.lock().armed.take() {
            schedule.due.remove(&slot);
        }
        Ok(())
    }

    /// Name given at creation
    pub fn get_name(&self, id: TimerId) -> OsalResult<Option<&'static str>> {
        Ok(self.table.get(id)?.name)
    }

    /// Number of live timers
    pub fn count(&self) -> usize {
        self.table.len()
    }

    /// Tick of the earliest armed expiry
    pub fn next_expiry(&self) -> Option<u64> {
        let schedule = lock(self.core.port(), &self.schedule);
        schedule.due.keys().next().map(|&(at, _)| at)
    }

    /// Run every callback due at the current tick; returns how many ran
    pub fn service(&self) -> usize {
        let port = self.core.port();
        let now = port.tick_count();
        let mut fired = 0;

        loop {
            let timer = {
                let mut schedule = lock(port, &self.schedule);
                let Some((slot, id)) = schedule.pop_due(now) else {
                    break;
                };
                let Ok(timer) = self.table.get(id) else {
                    continue;
                };
                let mut state = timer.state.lock();
                if state.armed != Some(slot) {
                    continue;
                }
                state.armed = match timer.kind {
                    TimerKind::Once => None,
                    TimerKind::Periodic => Some(schedule.arm(slot.0 + state.period as u64, id)),
                };
                drop(state);
                timer
            };

            log::trace!("timer {:?} fired at {}", timer.name, now);
            let mut callback = timer.callback.lock();
            (*callback)();
            fired += 1;
        }
        fired
    }
}
