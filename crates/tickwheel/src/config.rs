use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TimerError};

/// Slots per wheel level when not specified.
pub const DEFAULT_SLOT_COUNT: usize = 10;
/// Base tick resolution of level 0 when not specified.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);
/// Number of wheel levels when not specified.
pub const DEFAULT_LEVEL_COUNT: usize = 6;

/// Construction parameters for a [`Timer`](crate::Timer).
///
/// All three knobs are fixed at construction; changing them requires building
/// a new timer. The defaults give a level-0 resolution of 50 ms and a total
/// hierarchy span of roughly 14 hours; intervals beyond the span park on the
/// coarsest level and rotate until their due time comes into range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Number of slots per wheel. Identical for every level.
    pub slot_count: usize,
    /// Real-time interval between two level-0 ticks.
    pub tick_interval: Duration,
    /// Number of wheel levels. Level `i` has a tick interval equal to the
    /// total span of level `i - 1`.
    pub level_count: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            level_count: DEFAULT_LEVEL_COUNT,
        }
    }
}

impl TimerConfig {
    /// Creates a configuration with the default knobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of slots per wheel.
    #[must_use]
    pub fn slot_count(mut self, count: usize) -> Self {
        self.slot_count = count;
        self
    }

    /// Sets the level-0 tick interval.
    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the number of wheel levels.
    #[must_use]
    pub fn level_count(mut self, count: usize) -> Self {
        self.level_count = count;
        self
    }

    /// Checks the configuration against the structural limits of the wheel.
    pub(crate) fn validate(&self) -> Result<()> {
        // One slot cannot express "at least one tick ahead of the pointer".
        if self.slot_count < 2 {
            return Err(TimerError::InvalidConfig(format!(
                "slot_count must be at least 2, got {}",
                self.slot_count
            )));
        }
        if self.level_count < 1 {
            return Err(TimerError::InvalidConfig(
                "level_count must be at least 1".into(),
            ));
        }
        if self.tick_interval < Duration::from_millis(1) {
            return Err(TimerError::InvalidConfig(format!(
                "tick_interval must be at least 1ms, got {:?}",
                self.tick_interval
            )));
        }
        // Geometric growth must stay representable in u64 milliseconds.
        let tick_ms = self.tick_interval.as_millis() as u64;
        let mut span = tick_ms;
        for _ in 0..self.level_count {
            span = span.checked_mul(self.slot_count as u64).ok_or_else(|| {
                TimerError::InvalidConfig(format!(
                    "hierarchy span overflows with {} levels of {} slots",
                    self.level_count, self.slot_count
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TimerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_single_slot() {
        let cfg = TimerConfig::new().slot_count(1);
        assert!(matches!(
            cfg.validate(),
            Err(TimerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_zero_levels() {
        let cfg = TimerConfig::new().level_count(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_sub_millisecond_tick() {
        let cfg = TimerConfig::new().tick_interval(Duration::from_micros(100));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_overflowing_hierarchy() {
        let cfg = TimerConfig::new().slot_count(1 << 16).level_count(8);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_chain() {
        let cfg = TimerConfig::new()
            .slot_count(32)
            .tick_interval(Duration::from_millis(10))
            .level_count(3);
        assert_eq!(cfg.slot_count, 32);
        assert_eq!(cfg.tick_interval, Duration::from_millis(10));
        assert_eq!(cfg.level_count, 3);
        assert!(cfg.validate().is_ok());
    }
}
