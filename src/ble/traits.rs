//! BLE peripheral trait for abstraction and testability
//!
//! The BLE module is a command-driven GATT peripheral. It assigns service and
//! characteristic ids as they are added, buffers inbound writes until the
//! next `update`, and owns a small NV region (see [`NvStorage`]).
//!
//! [`NvStorage`]: crate::storage::NvStorage

use core::future::Future;

use heapless::Vec;

use crate::ble::characteristic::CharacteristicDef;
use crate::config::ble::ATTRIBUTE_MAX;

/// Characteristic id assigned by the peripheral
pub type CharId = u8;

/// Service id assigned by the peripheral
pub type ServiceId = u8;

/// Errors that can occur during BLE peripheral operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleError {
    /// Module did not answer
    NotResponding,
    /// Module answered with an error
    CommandFailed,
    /// Characteristic value update was not confirmed
    NotifyFailed,
    /// No room for another characteristic
    TableFull,
}

/// A write delivered by a connected central
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWrite {
    pub char_id: CharId,
    pub data: Vec<u8, ATTRIBUTE_MAX>,
}

/// Abstract BLE peripheral interface
pub trait BlePeripheral {
    /// Bring up the module and check it answers
    fn begin(&mut self) -> impl Future<Output = Result<(), BleError>>;

    /// Set the advertised GAP device name
    fn set_device_name(&mut self, name: &str) -> impl Future<Output = Result<(), BleError>>;

    /// Remove all custom services and characteristics
    fn clear_gatt(&mut self) -> impl Future<Output = Result<(), BleError>>;

    /// Add a primary service; characteristics added next belong to it
    fn add_service(&mut self, uuid: u16) -> impl Future<Output = Result<ServiceId, BleError>>;

    /// Add a characteristic to the last added service
    fn add_characteristic(&mut self, def: &CharacteristicDef) -> impl Future<Output = Result<CharId, BleError>>;

    /// Replace the advertising payload
    fn set_adv_data(&mut self, data: &[u8]) -> impl Future<Output = Result<(), BleError>>;

    /// Software reset; required for GATT changes to take effect
    fn reset(&mut self) -> impl Future<Output = Result<(), BleError>>;

    /// Deliver writes to `id` through `next_write`
    fn enable_write_events(&mut self, id: CharId) -> impl Future<Output = Result<(), BleError>>;

    /// Set a characteristic value, notifying subscribers
    fn set_char(&mut self, id: CharId, data: &[u8]) -> impl Future<Output = Result<(), BleError>>;

    /// Service the module for at most `budget_ms`, collecting inbound writes
    fn update(&mut self, budget_ms: u32) -> impl Future<Output = ()>;

    /// Next buffered inbound write
    fn next_write(&mut self) -> Option<GattWrite>;

    /// Drop the current connection
    fn disconnect(&mut self) -> impl Future<Output = Result<(), BleError>>;
}
