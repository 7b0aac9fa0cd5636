//! # Host Port
//!
//! Runs the Helix OSAL on operating-system threads, for simulation and
//! testing on a development machine.
//!
//! ## Features
//! - Parking on a condition variable per registered thread
//! - Monotonic tick derived from `Instant`
//! - Interrupt context simulated with [`interrupt`]
//! - A timer service thread driving [`helix_osal::timer::Timers::service`]
//!
//! ## Usage
//!
//! Create a [`HostPort`], bind it to an [`Osal`], then either adopt the
//! running thread with [`adopt_current`] or start new ones with [`spawn`].

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

mod config;
mod port;

#[cfg(test)]
mod tests;

pub use config::HostConfig;
pub use port::HostPort;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use helix_osal::{Osal, OsalError, OsalResult, Priority, ThreadId};

/// Run `f` as if it were an interrupt handler on the calling thread
pub fn interrupt<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);

    impl Drop for Restore {
        fn drop(&mut self) {
            HostPort::set_isr(self.0);
        }
    }

    let _restore = Restore(HostPort::set_isr(true));
    f()
}

/// Register the calling OS thread and bind it to the new identity
pub fn adopt_current(osal: &Osal, name: &'static str, priority: Priority) -> OsalResult<ThreadId> {
    let id = osal.threads().register(name, priority)?;
    HostPort::bind_current(id);
    Ok(id)
}

/// Start an OS thread registered as `name`.
///
/// The thread is terminated with the layer when `f` returns, which releases
/// any robust mutex it still holds and frees its state in the port.
pub fn spawn<F, R>(
    osal: &Arc<Osal>,
    name: &'static str,
    priority: Priority,
    f: F,
) -> OsalResult<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let id = osal.threads().register(name, priority)?;
    let shared = osal.clone();
    let spawned = std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            HostPort::bind_current(id);
            log::debug!("{} '{}' started", id, name);
            let result = f();
            log::debug!("{} '{}' exiting", id, name);
            if let Err(err) = shared.terminate_thread(id) {
                log::warn!("Terminating '{}' failed: {}", name, err);
            }
            HostPort::unbind_current();
            result
        });
    match spawned {
        Ok(handle) => Ok(handle),
        Err(err) => {
            log::error!("Failed to spawn '{}': {}", name, err);
            if let Err(err) = osal.terminate_thread(id) {
                log::warn!("Unregistering '{}' failed: {}", name, err);
            }
            Err(OsalError::Fail)
        }
    }
}

/// Thread that runs due timer callbacks
#[derive(Debug)]
pub struct TimerService {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimerService {
    /// Start servicing the timers of `osal`
    pub fn start(osal: &Arc<Osal>, config: &HostConfig) -> OsalResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let osal: Weak<Osal> = Arc::downgrade(osal);
        let poll = config.ticks_to_duration(config.timer_poll_ticks as u64);
        let handle = std::thread::Builder::new()
            .name("osal-timers".into())
            .spawn(move || {
                log::debug!("Timer service started");
                while !flag.load(Ordering::Acquire) {
                    let Some(osal) = osal.upgrade() else {
                        break;
                    };
                    osal.timers().service();
                    drop(osal);
                    std::thread::sleep(poll);
                }
                log::debug!("Timer service stopped");
            })
            .map_err(|err| {
                log::error!("Failed to start timer service: {}", err);
                OsalError::Fail
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the service and wait for it to exit
    pub fn shutdown(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Timer service panicked");
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.halt();
    }
}
