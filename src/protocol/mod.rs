//! Control protocol: fixed-layout codec and chunked transfer helper

pub mod chunked;
pub mod codec;

pub use chunked::{chunks, Chunks};
pub use codec::{
    AesKey, DecodeError, DevAddr, DeviceSession, Eui64, JoinCredentials, SessionRecord, TxResultRecord,
    TxStatus,
};
