//! Monotonic time source

/// Monotonic millisecond clock
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin (normally boot)
    fn now_ms(&self) -> u64;
}

/// Clock backed by the embassy time driver
#[cfg(feature = "firmware")]
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

#[cfg(feature = "firmware")]
impl Clock for EmbassyClock {
    fn now_ms(&self) -> u64 {
        embassy_time::Instant::now().as_millis()
    }
}
