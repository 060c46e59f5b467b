//! AT reply reader
//!
//! Reads bytes from the serial link, splits them into lines and collects
//! the data lines of one reply up to its final `OK` or `ERROR`.

use heapless::{String, Vec};

use crate::clock::Clock;
use crate::config::at::{MAX_LINE_LEN, MAX_REPLY_LINES};
use crate::serial::traits::{SerialError, SerialPort};

/// One line of module output, terminator removed
pub type Line = String<MAX_LINE_LEN>;

/// Data lines preceding the final `OK`
pub type Reply = Vec<Line, MAX_REPLY_LINES>;

/// Errors while waiting for a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Module answered `ERROR`
    Rejected,
    /// No final status line before the deadline
    Timeout,
    /// Link error
    Serial(SerialError),
}

impl From<SerialError> for ReadError {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Accumulates incoming bytes and extracts complete lines.
///
/// Lines end with `\n`; a trailing `\r` is dropped. Blank lines, lines that
/// overflow the buffer and lines that are not UTF-8 are discarded.
pub struct LineAccumulator {
    buffer: Vec<u8, MAX_LINE_LEN>,
    overflowed: bool,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            overflowed: false,
        }
    }

    /// Push a byte into the accumulator.
    ///
    /// Returns `Some(line)` when a complete line is detected.
    pub fn push(&mut self, byte: u8) -> Option<Line> {
        match byte {
            b'\n' => {
                let bytes = core::mem::take(&mut self.buffer);
                if core::mem::take(&mut self.overflowed) || bytes.is_empty() {
                    return None;
                }
                let text = core::str::from_utf8(&bytes).ok()?;
                let mut line = Line::new();
                line.push_str(text).ok()?;
                Some(line)
            }
            b'\r' => None,
            _ => {
                if self.buffer.push(byte).is_err() {
                    // Drop the rest of this line
                    self.buffer.clear();
                    self.overflowed = true;
                }
                None
            }
        }
    }

    /// Reset the accumulator, discarding any partial line.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflowed = false;
    }

    /// Returns true if no partial line is in progress.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && !self.overflowed
    }
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Reply reader
///
/// Bytes read past the end of one reply are kept for the next.
pub struct ReplyReader {
    accumulator: LineAccumulator,
    rx: [u8; 64],
    rx_pos: usize,
    rx_len: usize,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self {
            accumulator: LineAccumulator::new(),
            rx: [0; 64],
            rx_pos: 0,
            rx_len: 0,
        }
    }

    /// Read lines until `OK` or `ERROR`, giving up `timeout_ms` after the call
    pub async fn read_reply<S: SerialPort, C: Clock>(
        &mut self,
        port: &mut S,
        clock: &C,
        timeout_ms: u64,
    ) -> Result<Reply, ReadError> {
        let deadline = clock.now_ms().saturating_add(timeout_ms);
        let mut reply = Reply::new();

        loop {
            while self.rx_pos < self.rx_len {
                let byte = self.rx[self.rx_pos];
                self.rx_pos += 1;

                let Some(line) = self.accumulator.push(byte) else {
                    continue;
                };
                if line.as_str() == "OK" {
                    return Ok(reply);
                }
                if line.as_str() == "ERROR" {
                    return Err(ReadError::Rejected);
                }
                if reply.push(line).is_err() {
                    log::warn!("AT reply longer than {} lines", MAX_REPLY_LINES);
                }
            }

            if clock.now_ms() >= deadline {
                return Err(ReadError::Timeout);
            }

            self.rx_len = port.read(&mut self.rx).await?;
            self.rx_pos = 0;
        }
    }

    /// Discard buffered input, including any partial line
    pub fn reset(&mut self) {
        self.accumulator.reset();
        self.rx_pos = 0;
        self.rx_len = 0;
    }
}

impl Default for ReplyReader {
    fn default() -> Self {
        Self::new()
    }
}
