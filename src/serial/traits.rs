//! Serial link trait for abstraction and testability
//!
//! The BLE module is driven over a byte link (UART or an SPI bridge). This
//! trait lets the AT transport work with either the real driver or a mock.

use core::future::Future;

/// Errors that can occur during serial operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    /// Read error on the link
    ReadError,
    /// Buffer overflow
    OverflowError,
    /// Write error
    WriteError,
}

/// Abstract serial link
pub trait SerialPort {
    /// Read bytes into buffer
    ///
    /// Returns the number of bytes actually read. Returns `Ok(0)` when no
    /// data arrived within a short idle wait, so callers can enforce their
    /// own deadlines.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, SerialError>>;

    /// Write all bytes from buffer
    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), SerialError>>;

    /// Flush the write buffer
    fn flush(&mut self) -> impl Future<Output = Result<(), SerialError>>;
}

#[cfg(test)]
pub mod mock {
    //! Scripted serial link standing in for the BLE module

    use super::*;
    use core::cell::RefCell;
    use heapless::{Deque, Vec};

    const BUFFER_SIZE: usize = 1024;

    /// Canned reply released when a command line is written
    pub type Reply = Vec<u8, 128>;

    pub struct MockSerialPort {
        /// Bytes the module has "sent", oldest first
        incoming: RefCell<Deque<u8, BUFFER_SIZE>>,
        /// Everything written to the module
        sent: RefCell<Vec<u8, BUFFER_SIZE>>,
        /// One reply per completed command line, in order
        script: RefCell<Deque<Reply, 32>>,
        read_fault: RefCell<Option<SerialError>>,
        write_fault: RefCell<Option<SerialError>>,
    }

    impl MockSerialPort {
        pub fn new() -> Self {
            Self {
                incoming: RefCell::new(Deque::new()),
                sent: RefCell::new(Vec::new()),
                script: RefCell::new(Deque::new()),
                read_fault: RefCell::new(None),
                write_fault: RefCell::new(None),
            }
        }

        /// Make bytes available to read() immediately
        pub fn queue_rx_data(&self, data: &[u8]) {
            let mut incoming = self.incoming.borrow_mut();
            for &byte in data {
                let _ = incoming.push_back(byte);
            }
        }

        /// Script the module's answer to the next command line
        pub fn queue_reply(&self, reply: &str) {
            let mut bytes = Reply::new();
            let _ = bytes.extend_from_slice(reply.as_bytes());
            let _ = self.script.borrow_mut().push_back(bytes);
        }

        /// Command lines written so far, terminators removed
        pub fn sent_lines(&self) -> std::vec::Vec<std::string::String> {
            let sent = self.sent.borrow();
            std::string::String::from_utf8_lossy(&sent)
                .split_terminator('\n')
                .map(|line| line.trim_end_matches('\r').into())
                .collect()
        }

        pub fn set_next_read_error(&self, error: SerialError) {
            *self.read_fault.borrow_mut() = Some(error);
        }

        pub fn set_next_write_error(&self, error: SerialError) {
            *self.write_fault.borrow_mut() = Some(error);
        }
    }

    impl Default for MockSerialPort {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SerialPort for MockSerialPort {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
            if let Some(error) = self.read_fault.borrow_mut().take() {
                return Err(error);
            }

            let mut incoming = self.incoming.borrow_mut();
            let mut count = 0;
            while count < buf.len() {
                let Some(byte) = incoming.pop_front() else {
                    break;
                };
                buf[count] = byte;
                count += 1;
            }
            Ok(count)
        }

        async fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
            if let Some(error) = self.write_fault.borrow_mut().take() {
                return Err(error);
            }

            self.sent
                .borrow_mut()
                .extend_from_slice(data)
                .map_err(|_| SerialError::OverflowError)?;

            let lines_ended = data.iter().filter(|&&b| b == b'\n').count();
            for _ in 0..lines_ended {
                let next = self.script.borrow_mut().pop_front();
                if let Some(reply) = next {
                    self.queue_rx_data(&reply);
                }
            }
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), SerialError> {
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_read_in_pieces() {
            let mut port = MockSerialPort::new();
            port.queue_rx_data(b"12\r\nOK");

            futures::executor::block_on(async {
                let mut buf = [0u8; 3];
                assert_eq!(port.read(&mut buf).await, Ok(3));
                assert_eq!(&buf, b"12\r");

                let mut buf = [0u8; 8];
                let count = port.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..count], b"\nOK");

                // Drained
                assert_eq!(port.read(&mut buf).await, Ok(0));
            });
        }

        #[test]
        fn test_reply_released_per_line() {
            let mut port = MockSerialPort::new();
            port.queue_reply("OK\r\n");
            port.queue_reply("1\r\nOK\r\n");

            futures::executor::block_on(async {
                let mut buf = [0u8; 16];

                // A partial line releases nothing
                port.write(b"ATE").await.unwrap();
                assert_eq!(port.read(&mut buf).await, Ok(0));

                port.write(b"=0\n").await.unwrap();
                let count = port.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..count], b"OK\r\n");
            });

            assert_eq!(port.sent_lines(), ["ATE=0"]);
        }

        #[test]
        fn test_faults_are_one_shot() {
            let mut port = MockSerialPort::new();
            port.set_next_read_error(SerialError::ReadError);
            port.set_next_write_error(SerialError::WriteError);

            futures::executor::block_on(async {
                let mut buf = [0u8; 4];
                assert_eq!(port.read(&mut buf).await, Err(SerialError::ReadError));
                assert_eq!(port.read(&mut buf).await, Ok(0));

                assert_eq!(port.write(b"AT\n").await, Err(SerialError::WriteError));
                assert_eq!(port.write(b"AT\n").await, Ok(()));
            });
        }
    }
}
