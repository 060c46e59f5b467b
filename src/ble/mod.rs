//! Bluetooth Low Energy control channel
//!
//! GATT provisioning, inbound write dispatch and outbound notifications over
//! a command-driven BLE peripheral.

pub mod at;
pub mod channel;
pub mod characteristic;
pub mod traits;

pub use at::AtPeripheral;
pub use channel::{ControlChannel, SetupError, WriteOutcome};
pub use characteristic::{CharacteristicDef, ControlCharacteristic};
pub use traits::{BleError, BlePeripheral, CharId, GattWrite};
