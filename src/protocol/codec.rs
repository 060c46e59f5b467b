//! Control protocol codec
//!
//! Fixed-layout byte buffers exchanged over the LoRa control characteristics.
//! There is no framing beyond characteristic identity: each buffer's meaning
//! is given by the characteristic it was written to or notified on.
//!
//! # Payload formats
//!
//! Join credentials (32 bytes):
//! ```text
//! [app_key: 16][app_eui: 8][dev_eui: 8]
//! ```
//!
//! Session keys (36 bytes):
//! ```text
//! [dev_addr: 4 BE][nwk_skey: 16][app_skey: 16]
//! ```
//!
//! TX result (8 bytes, notify only):
//! ```text
//! [format: u8 = 1][ble_seq: u8][error: u16 LE][seq_no: u32 LE]
//! ```
//!
//! Persisted session record (39 bytes):
//! ```text
//! [version: u8 = 1][session keys: 36][crc16: u16 LE]
//! ```
//!
//! # Device address byte order
//!
//! The BLE app and NV storage carry the device address big-endian. The radio
//! stack holds it as a native `u32` in little-endian memory. [`DevAddr`] keeps
//! the wire form and converts exactly once in each direction.

use crate::config::{ble::ATTRIBUTE_MAX, nv::SESSION_RECORD_VERSION, protocol::TX_RESULT_FORMAT_V1};
use crate::protocol::chunked::chunks;
use crc::{Crc, CRC_16_XMODEM};

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// AES-128 key
pub type AesKey = [u8; 16];

/// EUI-64
pub type Eui64 = [u8; 8];

/// Errors decoding a fixed-width buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer width does not match the payload layout
    InvalidLength { expected: usize, actual: usize },
    /// Record carries an unknown format version
    UnsupportedVersion(u8),
    /// Record checksum mismatch
    CrcMismatch,
}

fn check_len(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() != expected {
        return Err(DecodeError::InvalidLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// LoRaWAN device address, stored in wire (big-endian) order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevAddr([u8; 4]);

impl DevAddr {
    pub const LEN: usize = 4;

    /// Address from big-endian wire bytes
    pub const fn from_wire(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Address from the radio stack's native value
    pub const fn from_native(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    /// Big-endian wire bytes
    pub const fn to_wire(self) -> [u8; 4] {
        self.0
    }

    /// Native value as handed to the radio stack
    ///
    /// Wire `DE AD AA AA` is `0xDEADAAAA`, laid out `AA AA AD DE` in the
    /// stack's little-endian memory.
    pub const fn native(self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

/// Over-the-air activation credentials, live for one join attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCredentials {
    pub app_key: AesKey,
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
}

impl JoinCredentials {
    /// Wire width of a join payload
    pub const LEN: usize = 32;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..16].copy_from_slice(&self.app_key);
        buf[16..24].copy_from_slice(&self.app_eui);
        buf[24..32].copy_from_slice(&self.dev_eui);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        check_len(data, Self::LEN)?;

        let mut creds = Self {
            app_key: [0; 16],
            app_eui: [0; 8],
            dev_eui: [0; 8],
        };
        creds.app_key.copy_from_slice(&data[0..16]);
        creds.app_eui.copy_from_slice(&data[16..24]);
        creds.dev_eui.copy_from_slice(&data[24..32]);
        Ok(creds)
    }
}

/// An established LoRaWAN session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    pub dev_addr: DevAddr,
    pub nwk_skey: AesKey,
    pub app_skey: AesKey,
    /// Next upstream frame counter
    pub seq_no_up: u32,
}

impl DeviceSession {
    /// Wire width of a session-key payload (sequence number excluded)
    pub const KEYS_LEN: usize = 36;

    /// Encode address and keys
    pub fn encode_keys(&self) -> [u8; Self::KEYS_LEN] {
        let mut buf = [0u8; Self::KEYS_LEN];
        buf[0..4].copy_from_slice(&self.dev_addr.to_wire());
        buf[4..20].copy_from_slice(&self.nwk_skey);
        buf[20..36].copy_from_slice(&self.app_skey);
        buf
    }

    /// Decode address and keys; the sequence number travels separately
    pub fn decode_keys(data: &[u8], seq_no_up: u32) -> Result<Self, DecodeError> {
        check_len(data, Self::KEYS_LEN)?;

        let mut addr = [0u8; 4];
        addr.copy_from_slice(&data[0..4]);
        let mut session = Self {
            dev_addr: DevAddr::from_wire(addr),
            nwk_skey: [0; 16],
            app_skey: [0; 16],
            seq_no_up,
        };
        session.nwk_skey.copy_from_slice(&data[4..20]);
        session.app_skey.copy_from_slice(&data[20..36]);
        Ok(session)
    }
}

/// Transmit status codes carried in [`TxResultRecord::error_code`]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Uplink completed (0x0000)
    Success = 0x0000,
    /// Watchdog expired before the stack reported completion (0x0001)
    Timeout = 0x0001,
    /// No session established (0x0002)
    NotReady = 0x0002,
    /// A transmit or receive is already pending (0x0003)
    Busy = 0x0003,
    /// Payload empty or wider than one attribute allows (0x0004)
    InvalidPayload = 0x0004,
    /// Radio stack refused the uplink (0x0005)
    Rejected = 0x0005,
    /// Pending uplink discarded by a new join or activation (0x0006)
    Cancelled = 0x0006,
}

/// Outcome of one transmit attempt, notified on the TX result characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxResultRecord {
    pub format_version: u8,
    pub ble_sequence: u8,
    pub error_code: u16,
    pub seq_no_up: u32,
}

impl TxResultRecord {
    pub const LEN: usize = 8;

    pub fn new(ble_sequence: u8, status: TxStatus, seq_no_up: u32) -> Self {
        Self {
            format_version: TX_RESULT_FORMAT_V1,
            ble_sequence,
            error_code: status as u16,
            seq_no_up,
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.format_version;
        buf[1] = self.ble_sequence;
        buf[2..4].copy_from_slice(&self.error_code.to_le_bytes());
        buf[4..8].copy_from_slice(&self.seq_no_up.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN]) -> Self {
        Self {
            format_version: buf[0],
            ble_sequence: buf[1],
            error_code: u16::from_le_bytes([buf[2], buf[3]]),
            seq_no_up: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Versioned, checksummed session image kept in NV storage
pub struct SessionRecord;

impl SessionRecord {
    pub const LEN: usize = 1 + DeviceSession::KEYS_LEN + 2;

    pub fn encode(session: &DeviceSession) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = SESSION_RECORD_VERSION;
        buf[1..1 + DeviceSession::KEYS_LEN].copy_from_slice(&session.encode_keys());

        let crc = CRC.checksum(&buf[..Self::LEN - 2]);
        buf[Self::LEN - 2..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::LEN], seq_no_up: u32) -> Result<DeviceSession, DecodeError> {
        if buf[0] != SESSION_RECORD_VERSION {
            return Err(DecodeError::UnsupportedVersion(buf[0]));
        }

        let stored = u16::from_le_bytes([buf[Self::LEN - 2], buf[Self::LEN - 1]]);
        if CRC.checksum(&buf[..Self::LEN - 2]) != stored {
            return Err(DecodeError::CrcMismatch);
        }

        DeviceSession::decode_keys(&buf[1..1 + DeviceSession::KEYS_LEN], seq_no_up)
    }
}

/// Battery level payload, clamped to 0..=100 percent
pub fn encode_battery_level(level: u8) -> [u8; 1] {
    [level.min(100)]
}

/// Split a log message into attribute-sized writes.
///
/// Bytes are emitted in order with no terminator; the receiver reassembles.
pub fn log_message_chunks(message: &str) -> impl Iterator<Item = &[u8]> {
    let bytes = message.as_bytes();
    chunks(bytes.len(), ATTRIBUTE_MAX).map(move |range| &bytes[range])
}
