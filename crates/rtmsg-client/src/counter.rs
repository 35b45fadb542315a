//! Exponential reconnect delay.

use std::time::Duration;

use rtmsg_core::ReconnectSettings;

/// Delay before the next reconnect attempt.
///
/// `current` is `base + step * 2^exponent`, clamped to `cap`. The value is
/// read first and then advanced, so the schedule starts at `base`:
/// 1000, 2000, 3000, 5000, 9000, ... with the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectCounter {
    base: u64,
    step: u64,
    exponent: u32,
    cap: Option<u64>,
    current: u64,
}

impl ReconnectCounter {
    pub fn new(base: u64, step: u64, cap: Option<u64>) -> Self {
        Self {
            base,
            step,
            exponent: 0,
            cap,
            current: base,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(settings.base_ms, settings.step_ms, settings.cap_ms)
    }

    /// Delay to use for the upcoming attempt.
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current)
    }

    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    pub fn increment(&mut self) {
        let factor = 1u64.checked_shl(self.exponent).unwrap_or(u64::MAX);
        let next = self.base.saturating_add(self.step.saturating_mul(factor));
        self.current = match self.cap {
            Some(cap) => next.min(cap),
            None => next,
        };
        self.exponent = self.exponent.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.exponent = 0;
        self.current = self.base;
    }
}
