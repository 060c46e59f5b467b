//! Log relay to the BLE log characteristic.
//!
//! Log records are formatted into bounded lines and queued in a [`LogRelay`].
//! The run loop drains the relay and writes each line to the log
//! characteristic. Queuing is non-blocking; when the relay is full the oldest
//! line is dropped.

use core::fmt::Write;

use heapless::{Deque, String};

/// Maximum length of a single relayed line
pub const MAX_LOG_LINE_LEN: usize = 96;

/// Number of lines held between drains
pub const LOG_RELAY_DEPTH: usize = 8;

pub type LogLine = String<MAX_LOG_LINE_LEN>;

/// Bounded FIFO of pending log lines
pub struct LogRelay {
    lines: Deque<LogLine, LOG_RELAY_DEPTH>,
    dropped: usize,
}

impl LogRelay {
    pub const fn new() -> Self {
        Self {
            lines: Deque::new(),
            dropped: 0,
        }
    }

    /// Queue a line, evicting the oldest if full
    pub fn push(&mut self, line: LogLine) {
        if self.lines.is_full() {
            self.lines.pop_front();
            self.dropped += 1;
        }
        let _ = self.lines.push_back(line);
    }

    /// Format and queue a line. Output past the line limit is cut off.
    pub fn push_fmt(&mut self, args: core::fmt::Arguments) {
        let mut line = LogLine::new();
        let _ = line.write_fmt(args);
        self.push(line);
    }

    pub fn pop(&mut self) -> Option<LogLine> {
        self.lines.pop_front()
    }

    /// Lines evicted since creation
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Default for LogRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "embedded")]
mod global {
    use core::cell::RefCell;

    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embassy_sync::blocking_mutex::Mutex;
    use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

    use super::{LogLine, LogRelay};

    /// Relay shared between the logger and the run loop
    static RELAY: Mutex<CriticalSectionRawMutex, RefCell<LogRelay>> = Mutex::new(RefCell::new(LogRelay::new()));

    static LOGGER: RelayLogger = RelayLogger;

    struct RelayLogger;

    impl Log for RelayLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            RELAY.lock(|relay| {
                relay
                    .borrow_mut()
                    .push_fmt(format_args!("{} {}", record.level(), record.args()))
            });
        }

        fn flush(&self) {}
    }

    /// Install the relay logger.
    ///
    /// Must be called once during startup, before the node is set up.
    pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(level);
        Ok(())
    }

    /// Take the oldest pending line
    pub fn take_line() -> Option<LogLine> {
        RELAY.lock(|relay| relay.borrow_mut().pop())
    }
}

#[cfg(feature = "embedded")]
pub use global::{init, take_line};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_fifo_order() {
        let mut relay = LogRelay::new();
        relay.push_fmt(format_args!("first {}", 1));
        relay.push_fmt(format_args!("second"));

        assert_eq!(relay.pop().unwrap().as_str(), "first 1");
        assert_eq!(relay.pop().unwrap().as_str(), "second");
        assert!(relay.pop().is_none());
    }

    #[test]
    fn test_relay_drops_oldest_when_full() {
        let mut relay = LogRelay::new();
        for i in 0..LOG_RELAY_DEPTH + 2 {
            relay.push_fmt(format_args!("line {}", i));
        }

        assert_eq!(relay.dropped(), 2);
        assert_eq!(relay.pop().unwrap().as_str(), "line 2");
    }

    #[test]
    fn test_long_line_bounded() {
        let mut relay = LogRelay::new();
        let long = [b'x'; 200];
        relay.push_fmt(format_args!("{}", core::str::from_utf8(&long).unwrap()));

        assert!(relay.pop().unwrap().len() <= MAX_LOG_LINE_LEN);
    }
}
