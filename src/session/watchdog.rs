//! Transmit watchdog
//!
//! A single one-shot deadline. The controller arms it when an uplink is
//! queued and cancels it when the stack reports completion.

/// One-shot transmit deadline in milliseconds
#[derive(Debug, Clone, Copy)]
pub struct TxWatchdog {
    timeout_ms: u64,
    deadline_ms: Option<u64>,
}

impl TxWatchdog {
    pub const fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            deadline_ms: None,
        }
    }

    /// Arm (or re-arm) relative to `now_ms`
    pub fn arm(&mut self, now_ms: u64) {
        self.deadline_ms = Some(now_ms.saturating_add(self.timeout_ms));
    }

    pub fn cancel(&mut self) {
        self.deadline_ms = None;
    }

    /// True once the deadline has passed. Does not disarm.
    pub fn expired(&self, now_ms: u64) -> bool {
        matches!(self.deadline_ms, Some(deadline) if now_ms >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_fires_at_deadline() {
        let mut watchdog = TxWatchdog::new(20_000);
        assert!(!watchdog.expired(u64::MAX));

        watchdog.arm(1_000);
        assert!(!watchdog.expired(20_999));
        assert!(watchdog.expired(21_000));
    }

    #[test]
    fn test_watchdog_cancel() {
        let mut watchdog = TxWatchdog::new(20_000);
        watchdog.arm(0);
        watchdog.cancel();

        assert!(!watchdog.expired(40_000));
    }

    #[test]
    fn test_watchdog_arm_near_clock_end() {
        let mut watchdog = TxWatchdog::new(20_000);
        watchdog.arm(u64::MAX - 5);
        assert!(!watchdog.expired(u64::MAX - 1));
        assert!(watchdog.expired(u64::MAX));
    }
}
