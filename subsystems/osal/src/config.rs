//! # OSAL Configuration

use crate::error::{OsalError, OsalResult};
use crate::wait::WaitOrder;

/// Configuration for an [`Osal`](crate::Osal) instance
#[derive(Debug, Clone)]
pub struct OsalConfig {
    /// Maximum lock depth of a recursive mutex
    pub recursive_lock_limit: u32,
    /// Usable bits in an event flags object (bit0 upwards)
    pub event_flag_bits: u32,
    /// Usable bits in a thread notification word
    pub notify_flag_bits: u32,
    /// Largest message a queue may be created for (bytes)
    pub max_queue_msg_size: usize,
    /// Order in which blocked semaphore acquirers are served
    pub semaphore_wait_order: WaitOrder,
    /// Reject unknown attribute bits instead of ignoring them
    pub strict_attr_check: bool,
}

impl OsalConfig {
    /// Default recursive lock bound
    pub const DEFAULT_RECURSIVE_LOCK_LIMIT: u32 = 255;
    /// Usable event bits on the common 32-bit event-group ports
    pub const DEFAULT_EVENT_FLAG_BITS: u32 = 24;
    /// Usable notification bits (top bit reserved for error returns)
    pub const DEFAULT_NOTIFY_FLAG_BITS: u32 = 31;
    /// Default message size limit: 4 KiB
    pub const DEFAULT_MAX_QUEUE_MSG_SIZE: usize = 4096;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            recursive_lock_limit: Self::DEFAULT_RECURSIVE_LOCK_LIMIT,
            event_flag_bits: Self::DEFAULT_EVENT_FLAG_BITS,
            notify_flag_bits: Self::DEFAULT_NOTIFY_FLAG_BITS,
            max_queue_msg_size: Self::DEFAULT_MAX_QUEUE_MSG_SIZE,
            semaphore_wait_order: WaitOrder::Fifo,
            strict_attr_check: true,
        }
    }

    /// Configuration where every wait list is served by priority
    pub fn realtime() -> Self {
        Self {
            semaphore_wait_order: WaitOrder::Priority,
            ..Self::new()
        }
    }

    /// Configuration that tolerates unknown attribute bits
    pub fn lenient() -> Self {
        Self {
            strict_attr_check: false,
            ..Self::new()
        }
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> OsalResult<()> {
        if self.recursive_lock_limit == 0 {
            return Err(OsalError::InvalidArg);
        }
        if !(1..=31).contains(&self.event_flag_bits) {
            return Err(OsalError::InvalidArg);
        }
        if !(1..=31).contains(&self.notify_flag_bits) {
            return Err(OsalError::InvalidArg);
        }
        if self.max_queue_msg_size == 0 {
            return Err(OsalError::InvalidArg);
        }
        Ok(())
    }
}

impl Default for OsalConfig {
    fn default() -> Self {
        Self::new()
    }
}
