//! # Host Port Configuration

use core::time::Duration;

/// Configuration for the hosted port
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Tick frequency in Hz
    pub tick_hz: u32,
    /// Longest the timer service sleeps between checks (in ticks)
    pub timer_poll_ticks: u32,
}

impl HostConfig {
    /// Default tick: 1 kHz
    pub const DEFAULT_TICK_HZ: u32 = 1000;
    /// Default timer poll: every tick
    pub const DEFAULT_TIMER_POLL_TICKS: u32 = 1;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            tick_hz: Self::DEFAULT_TICK_HZ,
            timer_poll_ticks: Self::DEFAULT_TIMER_POLL_TICKS,
        }
    }

    /// Coarse 100 Hz tick, as on many small targets
    pub fn coarse() -> Self {
        Self {
            tick_hz: 100,
            ..Self::new()
        }
    }

    /// Wall-clock length of `ticks` ticks
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let hz = self.tick_hz.max(1) as u128;
        let nanos = ticks as u128 * 1_000_000_000 / hz;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Whole ticks in `elapsed`
    pub fn duration_to_ticks(&self, elapsed: Duration) -> u64 {
        let ticks = elapsed.as_nanos() * self.tick_hz as u128 / 1_000_000_000;
        ticks.min(u64::MAX as u128) as u64
    }

    /// Check the configuration for consistency
    pub fn is_valid(&self) -> bool {
        self.tick_hz > 0 && self.tick_hz <= 1_000_000 && self.timer_poll_ticks > 0
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}
