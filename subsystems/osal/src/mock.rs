//! Single-threaded port with a virtual clock.
//!
//! `park` never sleeps: it consumes a pending unpark token, or else moves
//! the clock forward by the whole timeout. An unbounded park with no token
//! panics, since nothing could ever wake the caller. `on_park` installs a
//! one-shot hook that runs at the next park and stands in for whatever
//! another thread or interrupt would have done meanwhile.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::port::{CriticalState, Port, PortError};
use crate::{Osal, OsalConfig, Priority, ThreadId};

type Hook = Box<dyn FnOnce() + Send>;

pub(crate) struct MockPort {
    now: AtomicU64,
    isr: AtomicBool,
    current: AtomicU64,
    tokens: spin::Mutex<BTreeSet<ThreadId>>,
    unparked: spin::Mutex<Vec<ThreadId>>,
    priorities: spin::Mutex<BTreeMap<ThreadId, Priority>>,
    terminated: spin::Mutex<BTreeSet<ThreadId>>,
    hook: spin::Mutex<Option<Hook>>,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            now: AtomicU64::new(1000),
            isr: AtomicBool::new(false),
            current: AtomicU64::new(0),
            tokens: spin::Mutex::new(BTreeSet::new()),
            unparked: spin::Mutex::new(Vec::new()),
            priorities: spin::Mutex::new(BTreeMap::new()),
            terminated: spin::Mutex::new(BTreeSet::new()),
            hook: spin::Mutex::new(None),
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    pub(crate) fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    pub(crate) fn set_isr(&self, isr: bool) {
        self.isr.store(isr, Ordering::SeqCst);
    }

    pub(crate) fn set_current(&self, thread: ThreadId) {
        self.current.store(thread.as_u64(), Ordering::SeqCst);
    }

    pub(crate) fn was_unparked(&self, thread: ThreadId) -> bool {
        self.unparked.lock().contains(&thread)
    }

    /// Last priority reported for `thread`
    pub(crate) fn priority_of(&self, thread: ThreadId) -> Option<Priority> {
        self.priorities.lock().get(&thread).copied()
    }

    pub(crate) fn was_terminated(&self, thread: ThreadId) -> bool {
        self.terminated.lock().contains(&thread)
    }

    pub(crate) fn on_park(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

impl Port for MockPort {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn current_thread(&self) -> Result<ThreadId, PortError> {
        match self.current.load(Ordering::SeqCst) {
            0 => Err(PortError::UnknownThread),
            raw => Ok(ThreadId::from_raw(raw)),
        }
    }

    fn in_isr(&self) -> bool {
        self.isr.load(Ordering::SeqCst)
    }

    fn tick_count(&self) -> u64 {
        self.now()
    }

    fn tick_freq(&self) -> u32 {
        1000
    }

    fn enter_critical(&self) -> CriticalState {
        0
    }

    fn exit_critical(&self, _state: CriticalState) {}

    fn park(&self, thread: ThreadId, timeout: Option<u64>) {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        if self.tokens.lock().remove(&thread) {
            return;
        }
        match timeout {
            Some(ticks) => self.advance(ticks),
            None => panic!("{} parked forever with nothing left to wake it", thread),
        }
    }

    fn unpark(&self, thread: ThreadId) {
        self.tokens.lock().insert(thread);
        self.unparked.lock().push(thread);
    }

    fn priority_changed(&self, thread: ThreadId, effective: Priority) {
        self.priorities.lock().insert(thread, effective);
    }

    fn thread_terminated(&self, thread: ThreadId) {
        self.terminated.lock().insert(thread);
    }
}

pub(crate) fn setup() -> (Arc<MockPort>, Arc<Osal>, ThreadId) {
    setup_with(OsalConfig::new())
}

pub(crate) fn setup_with(config: OsalConfig) -> (Arc<MockPort>, Arc<Osal>, ThreadId) {
    let port = Arc::new(MockPort::new());
    let osal = Arc::new(Osal::new(port.clone(), config).expect("valid config"));
    let main = osal
        .threads()
        .register("main", Priority::NORMAL)
        .expect("register main");
    port.set_current(main);
    (port, osal, main)
}
