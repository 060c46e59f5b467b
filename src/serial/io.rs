//! [`SerialPort`] over any `embedded_io_async` UART

use embassy_time::{with_timeout, Duration};
use embedded_io_async::{Read, Write};

use crate::config::at::READ_POLL_MS;
use crate::serial::traits::{SerialError, SerialPort};

/// Wraps a driver implementing `embedded_io_async::Read + Write`.
///
/// Reads that see no data within [`READ_POLL_MS`] return `Ok(0)`.
pub struct IoPort<T> {
    inner: T,
}

impl<T> IoPort<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Write> SerialPort for IoPort<T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        match with_timeout(Duration::from_millis(READ_POLL_MS), self.inner.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(_)) => Err(SerialError::ReadError),
            Err(_) => Ok(0),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        self.inner.write_all(data).await.map_err(|_| SerialError::WriteError)
    }

    async fn flush(&mut self) -> Result<(), SerialError> {
        self.inner.flush().await.map_err(|_| SerialError::WriteError)
    }
}
