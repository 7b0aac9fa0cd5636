//! # Flag Engine
//!
//! Bitmask wait algebra shared by event flag objects and per-thread
//! notification words.
//!
//! A waiter asks for a set of bits `F` and either ANY (default) or ALL:
//! - ANY is satisfied when `value & F != 0`
//! - ALL is satisfied when `value & F == F`
//!
//! On success the satisfying bits (`value & F`) are cleared in the same
//! critical section that decides the wake, unless `NO_CLEAR` is given. A
//! second waiter therefore never observes bits already consumed.

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::error::{OsalError, OsalResult};
use crate::port::{lock, Port};
use crate::time::{Deadline, Timeout};
use crate::wait::{block, settle_timeout, Caller, Wake, WaitOrder, WaitQueue};
use crate::ThreadId;

bitflags! {
    /// Options for a flag wait
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        /// Wait for all requested flags
        const ALL = 0x0000_0001;
        /// Leave the satisfying flags set
        const NO_CLEAR = 0x0000_0002;
    }
}

impl WaitOptions {
    /// Wait for any requested flag (default)
    pub const ANY: Self = Self::empty();

    /// Decode raw option bits; unknown bits are an argument error
    pub fn from_raw(raw: u32) -> OsalResult<Self> {
        Self::from_bits(raw).ok_or(OsalError::InvalidArg)
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::ANY
    }
}

/// Usable bit range of a flag word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSpace {
    bits: u32,
}

const_assert!(FlagSpace::MAX_BITS < u32::BITS);

impl FlagSpace {
    /// Widest supported word; the top bit stays reserved for error returns
    pub const MAX_BITS: u32 = 31;

    /// Flag space of `bits` usable bits
    pub const fn new(bits: u32) -> Self {
        let bits = if bits > Self::MAX_BITS { Self::MAX_BITS } else { bits };
        Self { bits }
    }

    /// Number of usable bits
    pub const fn bits(self) -> u32 {
        self.bits
    }

    /// Mask of usable bits
    pub const fn mask(self) -> u32 {
        (1u32 << self.bits) - 1
    }

    /// Mask of reserved bits
    pub const fn invalid_bits(self) -> u32 {
        !self.mask()
    }

    /// Reject words with reserved bits set
    pub fn check(self, flags: u32) -> OsalResult<u32> {
        if flags & self.invalid_bits() != 0 {
            return Err(OsalError::InvalidArg);
        }
        Ok(flags)
    }
}

/// What a waiter asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlagRequest {
    flags: u32,
    options: WaitOptions,
}

impl FlagRequest {
    /// Bits that satisfy this request in `value`, if it is satisfied
    fn satisfied_by(&self, value: u32) -> Option<u32> {
        let hit = value & self.flags;
        let ok = if self.options.contains(WaitOptions::ALL) {
            hit == self.flags
        } else {
            hit != 0
        };
        ok.then_some(hit)
    }

    fn clears(&self) -> bool {
        !self.options.contains(WaitOptions::NO_CLEAR)
    }
}

#[derive(Debug)]
struct FlagState {
    value: u32,
    waiters: WaitQueue<FlagRequest>,
}

impl FlagState {
    /// Test `request` against the word, consuming bits on success.
    /// Returns the word as seen before clearing.
    fn try_take(&mut self, request: &FlagRequest) -> Option<u32> {
        let hit = request.satisfied_by(self.value)?;
        let seen = self.value;
        if request.clears() {
            self.value &= !hit;
        }
        Some(seen)
    }

    /// Serve blocked waiters in queue order against the current word
    fn wake_satisfied(&mut self, port: &dyn Port) {
        let mut index = 0;
        while index < self.waiters.len() {
            let request = match self.waiters.iter().nth(index) {
                Some(waiter) => waiter.request,
                None => break,
            };
            match self.try_take(&request) {
                Some(seen) => {
                    if let Some(waiter) = self.waiters.take(index) {
                        log::trace!("flags {:#x} wake {}", seen, waiter.thread);
                        waiter.wake(port, Wake::Granted(seen));
                    }
                }
                None => index += 1,
            }
            if self.value == 0 {
                break;
            }
        }
    }
}

/// A flag word with its blocked waiters
#[derive(Debug)]
pub(crate) struct FlagGroup {
    space: FlagSpace,
    state: spin::Mutex<FlagState>,
}

impl FlagGroup {
    pub(crate) fn new(space: FlagSpace) -> Self {
        Self {
            space,
            state: spin::Mutex::new(FlagState {
                value: 0,
                waiters: WaitQueue::new(WaitOrder::Fifo),
            }),
        }
    }

    pub(crate) fn space(&self) -> FlagSpace {
        self.space
    }

    /// OR `flags` in and wake whoever is now satisfied.
    /// Returns the word after waiters consumed their bits.
    pub(crate) fn set(&self, port: &dyn Port, flags: u32) -> OsalResult<u32> {
        let flags = self.space.check(flags)?;
        let mut state = lock(port, &self.state);
        state.value |= flags;
        state.wake_satisfied(port);
        Ok(state.value)
    }

    /// AND-NOT `flags`. Returns the word before clearing.
    pub(crate) fn clear(&self, port: &dyn Port, flags: u32) -> OsalResult<u32> {
        let flags = self.space.check(flags)?;
        let mut state = lock(port, &self.state);
        let previous = state.value;
        state.value &= !flags;
        Ok(previous)
    }

    pub(crate) fn get(&self, port: &dyn Port) -> u32 {
        lock(port, &self.state).value
    }

    /// Check a request without blocking
    pub(crate) fn poll(
        &self,
        port: &dyn Port,
        flags: u32,
        options: WaitOptions,
    ) -> OsalResult<u32> {
        let request = Self::request(self.space, flags, options)?;
        lock(port, &self.state).try_take(&request).ok_or(OsalError::Resource)
    }

    /// Block `caller` until the request is satisfied or `timeout` passes.
    /// Returns the word as seen at the moment of satisfaction.
    pub(crate) fn wait(
        &self,
        port: &dyn Port,
        caller: Caller,
        flags: u32,
        options: WaitOptions,
        timeout: Timeout,
    ) -> OsalResult<u32> {
        let request = Self::request(self.space, flags, options)?;
        let deadline = Deadline::after(port.tick_count(), timeout);

        loop {
            let slot = {
                let mut state = lock(port, &self.state);
                if let Some(seen) = state.try_take(&request) {
                    return Ok(seen);
                }
                if timeout.is_no_wait() {
                    return Err(OsalError::Resource);
                }
                if deadline.expired(port.tick_count()) {
                    return Err(OsalError::Timeout);
                }
                state.waiters.push(caller, request)
            };

            let wake = match block(port, caller.thread, &slot, deadline) {
                Some(wake) => Some(wake),
                None => settle_timeout(&mut lock(port, &self.state).waiters, &slot),
            };
            match wake {
                Some(Wake::Granted(seen)) => return Ok(seen),
                Some(Wake::Deleted) => return Err(OsalError::Resource),
                Some(Wake::Retry) => continue,
                None => return Err(OsalError::Timeout),
            }
        }
    }

    /// Withdraw the pending waits of `thread`
    pub(crate) fn cancel(&self, port: &dyn Port, thread: ThreadId) -> usize {
        lock(port, &self.state).waiters.cancel(port, thread)
    }

    /// Release every waiter with an error
    pub(crate) fn close(&self, port: &dyn Port) -> usize {
        lock(port, &self.state).waiters.wake_all(port, Wake::Deleted)
    }

    fn request(space: FlagSpace, flags: u32, options: WaitOptions) -> OsalResult<FlagRequest> {
        let flags = space.check(flags)?;
        if flags == 0 {
            return Err(OsalError::InvalidArg);
        }
        Ok(FlagRequest { flags, options })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPort;
    use crate::Priority;

    fn caller() -> Caller {
        Caller {
            thread: ThreadId::from_raw(1),
            priority: Priority::NORMAL,
        }
    }

    #[test]
    fn test_space() {
        let space = FlagSpace::new(24);
        assert_eq!(space.mask(), 0x00FF_FFFF);
        assert_eq!(space.invalid_bits(), 0xFF00_0000);
        assert_eq!(space.check(0x0100_0000), Err(OsalError::InvalidArg));
        assert_eq!(FlagSpace::new(40).bits(), 31);
        assert_eq!(FlagSpace::new(31).check(0x8000_0000), Err(OsalError::InvalidArg));
    }

    #[test]
    fn test_any_clears_only_satisfying_bits() {
        let port = MockPort::new();
        let group = FlagGroup::new(FlagSpace::new(24));
        group.set(&port, 0b1011).unwrap();
        let seen = group.poll(&port, 0b0110, WaitOptions::ANY).unwrap();
        assert_eq!(seen, 0b1011);
        assert_eq!(group.get(&port), 0b1001);
    }

    #[test]
    fn test_all_requires_containment() {
        let port = MockPort::new();
        let group = FlagGroup::new(FlagSpace::new(24));
        group.set(&port, 0b0001).unwrap();
        assert_eq!(group.poll(&port, 0b0011, WaitOptions::ALL), Err(OsalError::Resource));
        group.set(&port, 0b0110).unwrap();
        assert_eq!(group.poll(&port, 0b0011, WaitOptions::ALL), Ok(0b0111));
        assert_eq!(group.get(&port), 0b0100);
    }

    #[test]
    fn test_no_clear() {
        let port = MockPort::new();
        let group = FlagGroup::new(FlagSpace::new(24));
        group.set(&port, 0b11).unwrap();
        let opts = WaitOptions::ALL | WaitOptions::NO_CLEAR;
        assert_eq!(group.poll(&port, 0b11, opts), Ok(0b11));
        assert_eq!(group.get(&port), 0b11);
    }

    #[test]
    fn test_reserved_bits_rejected_everywhere() {
        let port = MockPort::new();
        let group = FlagGroup::new(FlagSpace::new(24));
        assert_eq!(group.set(&port, 1 << 24), Err(OsalError::InvalidArg));
        assert_eq!(group.clear(&port, 1 << 31), Err(OsalError::InvalidArg));
        assert_eq!(group.poll(&port, 1 << 30, WaitOptions::ANY), Err(OsalError::InvalidArg));
        assert_eq!(group.poll(&port, 0, WaitOptions::ANY), Err(OsalError::InvalidArg));
        assert_eq!(group.get(&port), 0);
    }

    #[test]
    fn test_clear_returns_previous() {
        let port = MockPort::new();
        let group = FlagGroup::new(FlagSpace::new(24));
        group.set(&port, 0b111).unwrap();
        assert_eq!(group.clear(&port, 0b010), Ok(0b111));
        assert_eq!(group.get(&port), 0b101);
    }

    #[test]
    fn test_wait_times_out() {
        let port = MockPort::new();
        let group = FlagGroup::new(FlagSpace::new(24));
        let start = port.tick_count();
        let res = group.wait(&port, caller(), 0b1, WaitOptions::ANY, Timeout::Ticks(10));
        assert_eq!(res, Err(OsalError::Timeout));
        assert!(port.tick_count() >= start + 10);
        // the waiter left the queue
        assert_eq!(group.close(&port), 0);
    }

    #[test]
    fn test_wait_immediate_success() {
        let port = MockPort::new();
        let group = FlagGroup::new(FlagSpace::new(24));
        group.set(&port, 0b100).unwrap();
        let res = group.wait(&port, caller(), 0b110, WaitOptions::ANY, Timeout::Forever);
        assert_eq!(res, Ok(0b100));
        assert_eq!(group.get(&port), 0);
    }

    #[test]
    fn test_set_serves_waiters_in_order() {
        let port = MockPort::new();
        let group = FlagGroup::new(FlagSpace::new(24));
        let first = Caller { thread: ThreadId::from_raw(1), priority: Priority::NORMAL };
        let second = Caller { thread: ThreadId::from_raw(2), priority: Priority::NORMAL };
        let slot_a = {
            let mut state = group.state.lock();
            state.waiters.push(first, FlagRequest { flags: 0b1, options: WaitOptions::ANY })
        };
        let slot_b = {
            let mut state = group.state.lock();
            state.waiters.push(second, FlagRequest { flags: 0b1, options: WaitOptions::ANY })
        };
        // one bit, two waiters: only the first gets it
        assert_eq!(group.set(&port, 0b1), Ok(0));
        assert_eq!(slot_a.take(), Some(Wake::Granted(0b1)));
        assert_eq!(slot_b.take(), None);
        assert!(port.was_unparked(first.thread));
        assert!(!port.was_unparked(second.thread));
        assert_eq!(group.close(&port), 1);
        assert_eq!(slot_b.take(), Some(Wake::Deleted));
    }
}
