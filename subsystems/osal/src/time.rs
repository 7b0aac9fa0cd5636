//! # Timeouts and Ticks
//!
//! Every blocking call takes a [`Timeout`]. Zero always means "poll, do not
//! block"; [`WAIT_FOREVER`] is the one sentinel for an unbounded wait.
//! Anything convertible into a `Timeout` is accepted, so raw tick counts,
//! [`NoWait`] and [`Forever`] all work at call sites.

/// Raw timeout value meaning "wait indefinitely"
pub const WAIT_FOREVER: u32 = 0xFFFF_FFFF;

/// How long a blocking operation may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Check once and return
    NoWait,
    /// Wait at most this many ticks
    Ticks(u32),
    /// Wait until the condition holds
    Forever,
}

impl Timeout {
    /// Is this a pure poll? `Ticks(0)` polls just like `NoWait`.
    pub fn is_no_wait(self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Ticks(0))
    }

    /// The raw tick value, with [`WAIT_FOREVER`] for `Forever`
    pub fn as_raw(self) -> u32 {
        match self {
            Timeout::NoWait => 0,
            Timeout::Ticks(t) => t,
            Timeout::Forever => WAIT_FOREVER,
        }
    }
}

impl From<u32> for Timeout {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Timeout::NoWait,
            WAIT_FOREVER => Timeout::Forever,
            t => Timeout::Ticks(t),
        }
    }
}

/// Do not block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoWait;

impl From<NoWait> for Timeout {
    fn from(_: NoWait) -> Self {
        Timeout::NoWait
    }
}

/// Block until the condition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forever;

impl From<Forever> for Timeout {
    fn from(_: Forever) -> Self {
        Timeout::Forever
    }
}

/// Absolute point at which a wait gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    Never,
    At(u64),
}

impl Deadline {
    pub(crate) fn after(now: u64, timeout: Timeout) -> Self {
        match timeout {
            Timeout::Forever => Deadline::Never,
            Timeout::NoWait => Deadline::At(now),
            Timeout::Ticks(t) => Deadline::At(now.saturating_add(t as u64)),
        }
    }

    /// Ticks left before the deadline; `None` when unbounded
    pub(crate) fn remaining(self, now: u64) -> Option<u64> {
        match self {
            Deadline::Never => None,
            Deadline::At(at) => Some(at.saturating_sub(now)),
        }
    }

    pub(crate) fn expired(self, now: u64) -> bool {
        self.remaining(now) == Some(0)
    }
}

/// Convert milliseconds to ticks, rounding up.
pub fn ms_to_ticks(ms: u32, tick_freq: u32) -> u32 {
    let ticks = (ms as u64 * tick_freq as u64).div_ceil(1000);
    ticks.min(u32::MAX as u64) as u32
}

/// Convert ticks to milliseconds, rounding down.
pub fn ticks_to_ms(ticks: u32, tick_freq: u32) -> u32 {
    if tick_freq == 0 {
        return 0;
    }
    let ms = ticks as u64 * 1000 / tick_freq as u64;
    ms.min(u32::MAX as u64) as u32
}
