//! GATT layout and payload formats of the node, as seen from a central.

use anyhow::{anyhow, bail, Result};
use uuid::Uuid;

/// Bluetooth base UUID with a 16-bit value in bits 96..112
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit GATT UUID.
pub const fn short_uuid(value: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((value as u128) << 96))
}

pub const TX_RESULT: Uuid = short_uuid(0x2ADA);
pub const SEND_PACKET: Uuid = short_uuid(0x2ADB);
pub const DEV_ADDR: Uuid = short_uuid(0x2ADC);
pub const NWK_SKEY: Uuid = short_uuid(0x2ADD);
pub const APP_SKEY: Uuid = short_uuid(0x2ADE);
pub const ACTIVATE: Uuid = short_uuid(0x2AE3);
pub const SPREADING_FACTOR: Uuid = short_uuid(0x2AE4);
pub const STATUS: Uuid = short_uuid(0x2AE5);
pub const LOG_MESSAGE: Uuid = short_uuid(0x2AD6);

/// Status characteristic values
pub const STATUS_READY: u8 = 2;

/// TX result error codes
pub const TX_SUCCESS: u16 = 0x0000;
pub const TX_BUSY: u16 = 0x0003;

/// TX result notification.
/// Format: [format: u8 = 1][ble_seq: u8][error: u16 LE][seq_no: u32 LE]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxResult {
    pub ble_sequence: u8,
    pub error_code: u16,
    pub seq_no_up: u32,
}

impl TxResult {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 8 {
            bail!("TX result should be 8 bytes, got {}", data.len());
        }
        if data[0] != 0x01 {
            bail!("Unknown TX result format {:#04x}", data[0]);
        }
        Ok(Self {
            ble_sequence: data[1],
            error_code: u16::from_le_bytes([data[2], data[3]]),
            seq_no_up: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// Send-packet write: [ble_seq][data]
pub fn build_send_packet(ble_sequence: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + data.len());
    frame.push(ble_sequence);
    frame.extend_from_slice(data);
    frame
}

/// Parse a hex string of exactly `N` bytes (separators ignored).
pub fn parse_hex<const N: usize>(text: &str) -> Result<[u8; N]> {
    let digits: Vec<char> = text.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if digits.len() != N * 2 {
        bail!("Expected {} hex bytes, got '{}'", N, text);
    }

    let mut out = [0u8; N];
    for (i, pair) in digits.chunks(2).enumerate() {
        let s: String = pair.iter().collect();
        out[i] = u8::from_str_radix(&s, 16).map_err(|e| anyhow!("Bad hex '{}': {}", s, e))?;
    }
    Ok(out)
}
