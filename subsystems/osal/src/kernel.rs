//! # Kernel Services
//!
//! [`Osal`] binds a [`Port`] to one set of object tables and exposes every
//! primitive through it, together with the tick-based kernel services.

use alloc::sync::Arc;

use crate::config::OsalConfig;
use crate::error::{OsalError, OsalResult};
use crate::event::EventGroups;
use crate::mutex::Mutexes;
use crate::port::Port;
use crate::queue::Queues;
use crate::semaphore::Semaphores;
use crate::thread::{ThreadRecord, ThreadTable, Threads};
use crate::time::{self, Deadline, Timeout};
use crate::timer::Timers;
use crate::wait::Caller;
use crate::ThreadId;

/// Layer and backend identification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelInfo {
    /// Version of this layer
    pub api_version: &'static str,
    /// Name of the backend port
    pub backend: &'static str,
    /// Tick frequency in Hz
    pub tick_freq: u32,
}

/// State shared by every primitive of one instance
#[derive(Debug)]
pub(crate) struct Core {
    port: Arc<dyn Port>,
    pub(crate) config: OsalConfig,
    pub(crate) threads: ThreadTable,
}

impl Core {
    pub(crate) fn port(&self) -> &dyn Port {
        self.port.as_ref()
    }

    pub(crate) fn in_isr(&self) -> bool {
        self.port.in_isr()
    }

    /// Record of the calling thread
    pub(crate) fn current(&self) -> OsalResult<Arc<ThreadRecord>> {
        let id = self.port.current_thread()?;
        self.threads.get(id).map_err(|_| OsalError::Fail)
    }

    pub(crate) fn caller_of(&self, record: &ThreadRecord) -> Caller {
        Caller {
            thread: record.id(),
            priority: record.effective_priority(self.port()),
        }
    }

    /// Identity the calling thread blocks under
    pub(crate) fn caller(&self) -> OsalResult<Caller> {
        let record = self.current()?;
        Ok(self.caller_of(&record))
    }
}

/// The abstraction layer bound to one backend
#[derive(Debug)]
pub struct Osal {
    core: Arc<Core>,
    threads: Threads,
    events: EventGroups,
    mutexes: Mutexes,
    semaphores: Semaphores,
    queues: Queues,
    timers: Timers,
}

impl Osal {
    /// Bind a port with the given configuration
    pub fn new(port: Arc<dyn Port>, config: OsalConfig) -> OsalResult<Self> {
        config.validate()?;
        log::info!(
            "Helix OSAL {} on '{}' ({} Hz)",
            env!("CARGO_PKG_VERSION"),
            port.name(),
            port.tick_freq()
        );
        let core = Arc::new(Core {
            port,
            config,
            threads: ThreadTable::new(),
        });
        Ok(Self {
            threads: Threads::new(core.clone()),
            events: EventGroups::new(core.clone()),
            mutexes: Mutexes::new(core.clone()),
            semaphores: Semaphores::new(core.clone()),
            queues: Queues::new(core.clone()),
            timers: Timers::new(core.clone()),
            core,
        })
    }

    /// Bind a port with the default configuration
    pub fn with_port(port: Arc<dyn Port>) -> OsalResult<Self> {
        Self::new(port, OsalConfig::default())
    }

    /// Thread registry and notifications
    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    /// Event flag objects
    pub fn events(&self) -> &EventGroups {
        &self.events
    }

    /// Mutexes
    pub fn mutexes(&self) -> &Mutexes {
        &self.mutexes
    }

    /// Counting semaphores
    pub fn semaphores(&self) -> &Semaphores {
        &self.semaphores
    }

    /// Message queues
    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// Software timers
    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Backend this instance runs on
    pub fn port(&self) -> &Arc<dyn Port> {
        &self.core.port
    }

    /// Active configuration
    pub fn config(&self) -> &OsalConfig {
        &self.core.config
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    /// Layer version and backend name
    pub fn kernel_info(&self) -> KernelInfo {
        KernelInfo {
            api_version: env!("CARGO_PKG_VERSION"),
            backend: self.core.port.name(),
            tick_freq: self.core.port.tick_freq(),
        }
    }

    /// Current tick count
    pub fn tick_count(&self) -> u64 {
        self.core.port.tick_count()
    }

    /// Tick frequency in Hz
    pub fn tick_freq(&self) -> u32 {
        self.core.port.tick_freq()
    }

    /// Milliseconds to ticks, rounding up
    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        time::ms_to_ticks(ms, self.tick_freq())
    }

    /// Ticks to milliseconds, rounding down
    pub fn ticks_to_ms(&self, ticks: u32) -> u32 {
        time::ticks_to_ms(ticks, self.tick_freq())
    }

    /// Suspend the calling thread for `ticks` ticks
    pub fn delay(&self, ticks: u32) -> OsalResult<()> {
        if ticks == 0 {
            return Err(OsalError::InvalidArg);
        }
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let now = self.tick_count();
        self.sleep(Deadline::after(now, Timeout::Ticks(ticks)))
    }

    /// Suspend the calling thread until the tick count reaches `tick`
    pub fn delay_until(&self, tick: u64) -> OsalResult<()> {
        if tick <= self.tick_count() {
            return Err(OsalError::InvalidArg);
        }
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        self.sleep(Deadline::At(tick))
    }

    fn sleep(&self, deadline: Deadline) -> OsalResult<()> {
        let thread = self.core.current()?.id();
        let port = self.core.port();
        // stray unparks only shorten one park
        while let Some(remaining @ 1..) = deadline.remaining(port.tick_count()) {
            port.park(thread, Some(remaining));
        }
        Ok(())
    }

    /// Forget a thread that has finished or been killed.
    ///
    /// Any wait it still has queued on a primitive is withdrawn and ends
    /// with `Resource`, so no mutex or token is ever handed to it. Robust
    /// mutexes it still holds are released to their next waiter, and any
    /// wait on its notification word ends with `Resource`.
    pub fn terminate_thread(&self, id: ThreadId) -> OsalResult<()> {
        if self.core.in_isr() {
            return Err(OsalError::Isr);
        }
        let record = self.core.threads.get(id)?;
        let cancelled = self.events.cancel_waits(id)
            + self.mutexes.cancel_waits(id)
            + self.semaphores.cancel_waits(id)
            + self.queues.cancel_waits(id);
        let released = self.mutexes.release_owned_by(id);
        let woken = record.notify.close(self.core.port());
        self.core.threads.remove(id)?;
        self.core.port().thread_terminated(id);
        log::info!(
            "Terminated {} '{}' ({} wait(s) withdrawn, {} robust release(s), {} woken)",
            id,
            record.name(),
            cancelled,
            released,
            woken
        );
        Ok(())
    }
}
