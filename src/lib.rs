#![cfg_attr(not(test), no_std)]

pub mod ble;
pub mod clock;
pub mod config;
pub mod logging;
pub mod lora;
pub mod node;
pub mod protocol;
pub mod serial;
pub mod session;
pub mod storage;
