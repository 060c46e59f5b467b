pub mod controller;
pub mod watchdog;

pub use controller::{Downlink, ReadinessMode, SendError, SessionController, SessionOutput};
pub use watchdog::TxWatchdog;
