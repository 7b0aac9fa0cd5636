//! # Host Port
//!
//! [`Port`] on top of operating-system threads. Each registered thread owns
//! a parker (a token behind a mutex and condition variable); thread
//! identity and interrupt simulation are thread-local.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

use helix_osal::{CriticalState, Port, PortError, Priority, ThreadId};
use spin::RwLock;

use crate::config::HostConfig;

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
}

/// Single-token latch
#[derive(Debug, Default)]
struct Parker {
    token: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    fn park(&self, config: &HostConfig, timeout: Option<u64>) {
        let token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        let mut token = match timeout {
            None => self
                .cvar
                .wait_while(token, |ready| !*ready)
                .unwrap_or_else(PoisonError::into_inner),
            Some(ticks) => {
                self.cvar
                    .wait_timeout_while(token, config.ticks_to_duration(ticks), |ready| !*ready)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        *token = false;
    }

    fn unpark(&self) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cvar.notify_one();
    }
}

/// Hosted backend
#[derive(Debug)]
pub struct HostPort {
    config: HostConfig,
    epoch: Instant,
    parkers: RwLock<BTreeMap<ThreadId, Arc<Parker>>>,
    priorities: spin::Mutex<BTreeMap<ThreadId, Priority>>,
}

impl HostPort {
    /// Create a port with the default configuration
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    /// Create a port with a custom configuration
    pub fn with_config(config: HostConfig) -> Self {
        let config = if config.is_valid() {
            config
        } else {
            log::warn!("Invalid host config {:?}, using defaults", config);
            HostConfig::default()
        };
        Self {
            config,
            epoch: Instant::now(),
            parkers: RwLock::new(BTreeMap::new()),
            priorities: spin::Mutex::new(BTreeMap::new()),
        }
    }

    /// Port configuration
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Run the calling OS thread as `thread` from now on
    pub fn bind_current(thread: ThreadId) {
        CURRENT.with(|current| current.set(Some(thread)));
    }

    /// Detach the calling OS thread from its layer identity
    pub fn unbind_current() {
        CURRENT.with(|current| current.set(None));
    }

    /// Last effective priority the layer reported for `thread`
    pub fn effective_priority(&self, thread: ThreadId) -> Option<Priority> {
        self.priorities.lock().get(&thread).copied()
    }

    /// Drop the parker and reported priority of a finished thread
    pub fn forget(&self, thread: ThreadId) {
        self.parkers.write().remove(&thread);
        self.priorities.lock().remove(&thread);
    }

    #[cfg(test)]
    pub(crate) fn has_parker(&self, thread: ThreadId) -> bool {
        self.parkers.read().contains_key(&thread)
    }

    pub(crate) fn set_isr(active: bool) -> bool {
        IN_ISR.with(|isr| isr.replace(active))
    }

    fn parker(&self, thread: ThreadId) -> Arc<Parker> {
        if let Some(parker) = self.parkers.read().get(&thread) {
            return parker.clone();
        }
        self.parkers.write().entry(thread).or_default().clone()
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for HostPort {
    fn name(&self) -> &'static str {
        "host"
    }

    fn current_thread(&self) -> Result<ThreadId, PortError> {
        CURRENT
            .with(|current| current.get())
            .ok_or(PortError::UnknownThread)
    }

    fn in_isr(&self) -> bool {
        IN_ISR.with(|isr| isr.get())
    }

    fn tick_count(&self) -> u64 {
        self.config.duration_to_ticks(self.epoch.elapsed())
    }

    fn tick_freq(&self) -> u32 {
        self.config.tick_hz
    }

    // No interrupts to mask; the layer's spin locks serialize every update.
    fn enter_critical(&self) -> CriticalState {
        0
    }

    fn exit_critical(&self, _state: CriticalState) {}

    fn park(&self, thread: ThreadId, timeout: Option<u64>) {
        self.parker(thread).park(&self.config, timeout);
    }

    fn unpark(&self, thread: ThreadId) {
        self.parker(thread).unpark();
    }

    fn priority_changed(&self, thread: ThreadId, effective: Priority) {
        log::debug!("{} now runs at {}", thread, effective);
        self.priorities.lock().insert(thread, effective);
    }

    fn thread_terminated(&self, thread: ThreadId) {
        self.forget(thread);
    }
}
