//! Byte link to the BLE module and AT reply parsing

#[cfg(feature = "embedded")]
pub mod io;
pub mod reader;
pub mod traits;

#[cfg(feature = "embedded")]
pub use io::IoPort;
pub use reader::{ReadError, ReplyReader};
pub use traits::{SerialError, SerialPort};
