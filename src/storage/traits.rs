//! Non-volatile storage trait for abstraction and testability
//!
//! The BLE module exposes a small NV region over its command transport.
//! This trait lets the credential store work with either that transport
//! or a mock for testing.

use core::future::Future;

/// Errors that can occur during NV storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvError {
    /// Transport did not confirm the read
    ReadFailed,
    /// Transport did not confirm the write
    WriteFailed,
    /// Factory reset of the store failed
    ResetFailed,
    /// Address beyond the NV region
    OutOfRange,
}

/// Abstract NV storage interface
pub trait NvStorage {
    /// Largest transfer accepted by a single read or write request
    fn max_block_size(&self) -> usize;

    /// Read `buf.len()` bytes starting at `address`
    fn read(&mut self, address: u16, buf: &mut [u8]) -> impl Future<Output = Result<(), NvError>>;

    /// Write `data` starting at `address`
    fn write(&mut self, address: u16, data: &[u8]) -> impl Future<Output = Result<(), NvError>>;

    /// Destructively reset the store (and the module's settings) to defaults
    fn factory_reset(&mut self) -> impl Future<Output = Result<(), NvError>>;
}
