//! Millisecond time source for the transmit watchdog

/// Monotonic milliseconds since boot
pub trait Clock {
    fn now_ms(&self) -> u64;
}

impl<C: Clock> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Clock backed by the embassy time driver
#[cfg(feature = "embedded")]
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

#[cfg(feature = "embedded")]
impl Clock for EmbassyClock {
    fn now_ms(&self) -> u64 {
        embassy_time::Instant::now().as_millis()
    }
}
