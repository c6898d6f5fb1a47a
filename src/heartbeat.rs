//! Heartbeat LED
//!
//! Toggles an output at a fixed period. A heartbeat that stops blinking means
//! the main loop has stalled.

use embedded_hal::digital::{OutputPin, PinState};

use crate::config;

pub struct Heartbeat<P> {
    pin: P,
    level: bool,
    last_toggle_ms: u64,
    interval_ms: u64,
}

impl<P: OutputPin> Heartbeat<P> {
    /// Start with the LED off and the timer at zero
    pub fn new(pin: P, interval_ms: u64) -> Self {
        let mut heartbeat = Self {
            pin,
            level: false,
            last_toggle_ms: 0,
            interval_ms,
        };
        heartbeat.drive();
        heartbeat
    }

    pub fn with_default_interval(pin: P) -> Self {
        Self::new(pin, config::HEARTBEAT_INTERVAL_MS)
    }

    pub fn level(&self) -> bool {
        self.level
    }

    pub fn last_toggle_ms(&self) -> u64 {
        self.last_toggle_ms
    }

    /// Toggle if a full interval has passed since the last toggle.
    /// Returns whether the LED changed.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if now_ms.wrapping_sub(self.last_toggle_ms) < self.interval_ms {
            return false;
        }

        self.last_toggle_ms = now_ms;
        self.level = !self.level;
        self.drive();
        true
    }

    fn drive(&mut self) {
        // A stuck LED is not worth stopping the loop for
        let _ = self.pin.set_state(PinState::from(self.level));
    }
}
