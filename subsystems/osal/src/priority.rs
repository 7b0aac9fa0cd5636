//! # Priority Management
//!
//! Thread priority levels. Larger values are more urgent.

use core::fmt;

/// Thread priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// No priority (uninitialized)
    pub const NONE: Self = Self(0);
    /// Reserved for the idle thread
    pub const IDLE: Self = Self(1);
    /// Low
    pub const LOW: Self = Self(8);
    /// Below normal
    pub const BELOW_NORMAL: Self = Self(16);
    /// Normal (default)
    pub const NORMAL: Self = Self(24);
    /// Above normal
    pub const ABOVE_NORMAL: Self = Self(32);
    /// High
    pub const HIGH: Self = Self(40);
    /// Real-time
    pub const REALTIME: Self = Self(48);
    /// Reserved for ISR deferred threads
    pub const ISR: Self = Self(56);

    /// Number of sub-levels within a band (`LOW`, `LOW + 1` .. `LOW + 7`)
    pub const BAND_WIDTH: u8 = 8;

    /// Create a priority from its raw level
    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    /// Raw level
    pub const fn level(self) -> u8 {
        self.0
    }

    /// Sub-level within this band (clamped to the band)
    pub const fn offset(self, n: u8) -> Self {
        let n = if n >= Self::BAND_WIDTH { Self::BAND_WIDTH - 1 } else { n };
        Self(self.0.saturating_add(n))
    }

    /// Can a thread run at this priority?
    pub fn is_valid(self) -> bool {
        self >= Self::IDLE && self <= Self::ISR
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::IDLE < Priority::LOW);
        assert_eq!(Priority::LOW.offset(3).level(), 11);
        assert_eq!(Priority::LOW.offset(20), Priority::LOW.offset(7));
    }

    #[test]
    fn test_validity() {
        assert!(!Priority::NONE.is_valid());
        assert!(Priority::IDLE.is_valid());
        assert!(Priority::ISR.is_valid());
        assert!(!Priority::new(57).is_valid());
    }
}
