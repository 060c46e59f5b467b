//! Configuration constants for the LoRaWAN field node

use heapless::String;

/// Non-volatile storage layout
pub mod nv {
    /// Header value marking an initialised store ("NODE 2017")
    pub const MAGIC_NUMBER: u32 = 0x40DE_2017;

    /// Size of the magic number header at NV address 0
    pub const MAGIC_NUMBER_SIZE: u16 = 4;

    /// Offset of the persisted session record (relative to the header)
    pub const SESSION_RECORD_OFFSET: u16 = 0;

    /// Offset of the next upstream sequence number (relative to the header)
    pub const SEQ_NO_OFFSET: u16 = 40;

    /// Session record format version
    pub const SESSION_RECORD_VERSION: u8 = 1;
}

/// BLE transport limits
pub mod ble {
    /// Maximum attribute payload for a single characteristic write/notify
    pub const ATTRIBUTE_MAX: usize = 20;

    /// Time budget for a single peripheral poll
    pub const POLL_BUDGET_MS: u32 = 200;

    /// Maximum number of control characteristics in the dispatch table
    pub const MAX_CONTROL_CHARACTERISTICS: usize = 12;

    /// Advertised device name
    pub const DEVICE_NAME: &str = "LoRaNode";
}

/// GATT service and characteristic UUIDs (16-bit)
pub mod gatt {
    pub const LORA_SERVICE: u16 = 0x1830;
    pub const LOGGING_SERVICE: u16 = 0x1831;
    pub const DEVICE_INFO_SERVICE: u16 = 0x180A;
    pub const BATTERY_SERVICE: u16 = 0x180F;

    pub const TX_RESULT: u16 = 0x2ADA;
    pub const SEND_PACKET: u16 = 0x2ADB;
    pub const DEV_ADDR: u16 = 0x2ADC;
    pub const NWK_SKEY: u16 = 0x2ADD;
    pub const APP_SKEY: u16 = 0x2ADE;
    pub const APP_KEY: u16 = 0x2ADF;
    pub const APP_EUI: u16 = 0x2AE0;
    pub const DEV_EUI: u16 = 0x2AE1;
    pub const JOIN: u16 = 0x2AE2;
    pub const ACTIVATE: u16 = 0x2AE3;
    pub const SPREADING_FACTOR: u16 = 0x2AE4;
    pub const STATUS: u16 = 0x2AE5;

    pub const LOG_MESSAGE: u16 = 0x2AD6;
    pub const MANUFACTURER_NAME: u16 = 0x2A29;
    pub const SOFTWARE_REVISION: u16 = 0x2A28;
    pub const BATTERY_LEVEL: u16 = 0x2A19;

    /// GATT characteristic property bits
    pub mod props {
        pub const READ: u8 = 0x02;
        pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
        pub const WRITE: u8 = 0x08;
        pub const NOTIFY: u8 = 0x10;
    }
}

/// Default LoRaWAN radio settings (EU868)
pub mod lora_defaults {
    /// Network id used for activation-by-personalization
    pub const NET_ID: u32 = 0x13;

    /// Default spreading factor for uplinks
    pub const SPREADING_FACTOR: u8 = 10;

    /// Transmit power in dBm
    pub const TX_POWER_DBM: i8 = 20;

    /// Sub-band selected after channel setup
    pub const SUB_BAND: u8 = 1;

    /// Application port for uplinks
    pub const UPLINK_PORT: u8 = 1;
}

/// Timing
pub mod timing {
    /// Transmit watchdog: pending TX state is cleared after this long
    pub const TX_TIMEOUT_MS: u64 = 20_000;
}

/// AT command transport to the BLE module
pub mod at {
    /// Longest command or reply line
    pub const MAX_LINE_LEN: usize = 128;

    /// Data lines kept from one reply (before the final OK)
    pub const MAX_REPLY_LINES: usize = 4;

    /// Default wait for a reply
    pub const COMMAND_TIMEOUT_MS: u64 = 1_000;

    /// Wait for replies to ATZ and AT+FACTORYRESET
    pub const RESET_TIMEOUT_MS: u64 = 3_000;

    /// Largest NV transfer per AT+NVMREAD/AT+NVMWRITE
    pub const NV_BLOCK_SIZE: usize = 16;

    /// Size of the module's user NV region
    pub const NV_SIZE: usize = 256;

    /// Inbound writes buffered between polls
    pub const WRITE_QUEUE_DEPTH: usize = 8;

    /// Idle wait per serial read before the deadline is re-checked
    pub const READ_POLL_MS: u64 = 10;
}

/// Protocol constants
pub mod protocol {
    /// TX result record format version
    pub const TX_RESULT_FORMAT_V1: u8 = 0x01;

    /// Maximum uplink payload carried by one send-packet write
    /// (one attribute minus the BLE sequence byte)
    pub const MAX_UPLINK_PAYLOAD: usize = super::ble::ATTRIBUTE_MAX - 1;

    /// Maximum downlink payload retained from the radio stack
    pub const MAX_DOWNLINK_PAYLOAD: usize = 64;

    /// Firmware version reported over Device Information
    pub const FIRMWARE_VERSION: &str = "0.1.0";

    /// Manufacturer name reported over Device Information
    pub const MANUFACTURER: &str = "TheThingsNYC";
}

/// Runtime node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Advertised GAP device name
    pub device_name: String<20>,
    /// Device Information manufacturer string
    pub manufacturer: &'static str,
    /// Device Information software revision string
    pub firmware_version: &'static str,
    /// Spreading factor used for join and uplinks
    pub spreading_factor: u8,
    /// Transmit power in dBm
    pub tx_power_dbm: i8,
    /// Transmit watchdog timeout
    pub tx_timeout_ms: u64,
    /// Time budget for each BLE poll
    pub ble_poll_budget_ms: u32,
    /// Application port for uplinks
    pub uplink_port: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let mut device_name = String::new();
        let _ = device_name.push_str(ble::DEVICE_NAME);

        Self {
            device_name,
            manufacturer: protocol::MANUFACTURER,
            firmware_version: protocol::FIRMWARE_VERSION,
            spreading_factor: lora_defaults::SPREADING_FACTOR,
            tx_power_dbm: lora_defaults::TX_POWER_DBM,
            tx_timeout_ms: timing::TX_TIMEOUT_MS,
            ble_poll_budget_ms: ble::POLL_BUDGET_MS,
            uplink_port: lora_defaults::UPLINK_PORT,
        }
    }
}
