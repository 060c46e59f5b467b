//! GATT characteristic definitions
//!
//! Definitions render as the peripheral's `AT+GATTADDCHAR` command, e.g.
//!
//! ```text
//! AT+GATTADDCHAR=UUID=0x2ADA,PROPERTIES=0x10,MIN_LEN=1,MAX_LEN=16,DESCRIPTION=TX Result
//! ```

use core::fmt;
use core::ops::Range;

use crate::config::gatt::{self, props};
use crate::protocol::codec::{AesKey, DevAddr, Eui64};

/// Static description of one GATT characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDef {
    pub uuid: u16,
    pub properties: u8,
    pub min_len: u8,
    pub max_len: u8,
    pub description: Option<&'static str>,
    /// Initial value as the peripheral expects it in the command
    pub value: Option<&'static str>,
}

impl CharacteristicDef {
    pub const fn new(uuid: u16, properties: u8, min_len: u8, max_len: u8) -> Self {
        Self {
            uuid,
            properties,
            min_len,
            max_len,
            description: None,
            value: None,
        }
    }

    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }

    pub const fn with_value(mut self, value: &'static str) -> Self {
        self.value = Some(value);
        self
    }

    pub const fn is_writable(&self) -> bool {
        self.properties & (props::WRITE | props::WRITE_WITHOUT_RESPONSE) != 0
    }
}

impl fmt::Display for CharacteristicDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AT+GATTADDCHAR=UUID=0x{:04X},PROPERTIES=0x{:02X},MIN_LEN={},MAX_LEN={}",
            self.uuid, self.properties, self.min_len, self.max_len
        )?;
        if let Some(description) = self.description {
            write!(f, ",DESCRIPTION={}", description)?;
        }
        if let Some(value) = self.value {
            write!(f, ",VALUE={}", value)?;
        }
        Ok(())
    }
}

/// Notify-only TX result on the LoRa service
pub const TX_RESULT: CharacteristicDef =
    CharacteristicDef::new(gatt::TX_RESULT, props::NOTIFY, 1, 16).with_description("TX Result");

/// Readiness mode on the LoRa service
pub const STATUS: CharacteristicDef = CharacteristicDef::new(gatt::STATUS, props::READ | props::NOTIFY, 1, 1)
    .with_description("Status")
    .with_value("00");

/// Log message chunks on the logging service
pub const LOG_MESSAGE: CharacteristicDef = CharacteristicDef::new(gatt::LOG_MESSAGE, props::NOTIFY, 1, 20);

/// Battery level (0-100) on the battery service
pub const BATTERY_LEVEL: CharacteristicDef =
    CharacteristicDef::new(gatt::BATTERY_LEVEL, props::READ | props::NOTIFY, 1, 1).with_value("00");

/// Device Information manufacturer name
pub const fn manufacturer_name(value: &'static str) -> CharacteristicDef {
    CharacteristicDef::new(gatt::MANUFACTURER_NAME, props::READ, 1, 20).with_value(value)
}

/// Device Information software revision
pub const fn software_revision(value: &'static str) -> CharacteristicDef {
    CharacteristicDef::new(gatt::SOFTWARE_REVISION, props::READ, 1, 20).with_value(value)
}

/// Staging buffer a credential field is written into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staging {
    /// `[app_key: 16][app_eui: 8][dev_eui: 8]`
    Join,
    /// `[dev_addr: 4 BE][nwk_skey: 16][app_skey: 16]`
    Session,
}

/// Writable characteristics dispatched to the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCharacteristic {
    /// `[ble_seq][data: 1..=19]`
    SendPacket,
    DevAddr,
    NwkSKey,
    AppSKey,
    AppKey,
    AppEui,
    DevEui,
    /// Start a join from the staged credentials
    Join,
    /// Install the staged session keys
    Activate,
    SpreadingFactor,
}

const KEY_LEN: u8 = core::mem::size_of::<AesKey>() as u8;
const EUI_LEN: u8 = core::mem::size_of::<Eui64>() as u8;
const ADDR_LEN: u8 = DevAddr::LEN as u8;

impl ControlCharacteristic {
    /// Provisioning order
    pub const ALL: [Self; 10] = [
        Self::SendPacket,
        Self::DevAddr,
        Self::NwkSKey,
        Self::AppSKey,
        Self::AppKey,
        Self::AppEui,
        Self::DevEui,
        Self::Join,
        Self::Activate,
        Self::SpreadingFactor,
    ];

    pub const fn definition(self) -> CharacteristicDef {
        const W: u8 = props::WRITE;
        match self {
            Self::SendPacket => CharacteristicDef::new(gatt::SEND_PACKET, W | props::WRITE_WITHOUT_RESPONSE, 2, 20)
                .with_description("Send Packet"),
            Self::DevAddr => CharacteristicDef::new(gatt::DEV_ADDR, W, ADDR_LEN, ADDR_LEN).with_description("DevAddr"),
            Self::NwkSKey => CharacteristicDef::new(gatt::NWK_SKEY, W, KEY_LEN, KEY_LEN).with_description("NwkSKey"),
            Self::AppSKey => CharacteristicDef::new(gatt::APP_SKEY, W, KEY_LEN, KEY_LEN).with_description("AppSKey"),
            Self::AppKey => CharacteristicDef::new(gatt::APP_KEY, W, KEY_LEN, KEY_LEN).with_description("AppKey"),
            Self::AppEui => CharacteristicDef::new(gatt::APP_EUI, W, EUI_LEN, EUI_LEN).with_description("AppEUI"),
            Self::DevEui => CharacteristicDef::new(gatt::DEV_EUI, W, EUI_LEN, EUI_LEN).with_description("DevEUI"),
            Self::Join => CharacteristicDef::new(gatt::JOIN, W, 1, 4).with_description("Join"),
            Self::Activate => CharacteristicDef::new(gatt::ACTIVATE, W, 1, 4).with_description("Activate"),
            Self::SpreadingFactor => {
                CharacteristicDef::new(gatt::SPREADING_FACTOR, W | props::READ, 1, 1).with_description("SF")
            }
        }
    }

    /// Where a credential field lands in its staging buffer
    pub fn field(self) -> Option<(Staging, Range<usize>)> {
        match self {
            Self::AppKey => Some((Staging::Join, 0..16)),
            Self::AppEui => Some((Staging::Join, 16..24)),
            Self::DevEui => Some((Staging::Join, 24..32)),
            Self::DevAddr => Some((Staging::Session, 0..4)),
            Self::NwkSKey => Some((Staging::Session, 4..20)),
            Self::AppSKey => Some((Staging::Session, 20..36)),
            Self::SendPacket | Self::Join | Self::Activate | Self::SpreadingFactor => None,
        }
    }
}
