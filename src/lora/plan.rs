//! Channel plan and data rates handed to the LoRaWAN stack

use crate::config::lora_defaults;

/// LoRaWAN data rate (EU868 numbering)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Sf12 = 0,
    Sf11 = 1,
    Sf10 = 2,
    Sf9 = 3,
    Sf8 = 4,
    Sf7 = 5,
    /// SF7 at 250 kHz
    Sf7Bw250 = 6,
    Fsk = 7,
}

impl DataRate {
    /// Uplink data rate for a spreading factor.
    ///
    /// Only SF7..=SF10 are accepted for uplinks; anything else is `None`.
    pub fn from_spreading_factor(sf: u8) -> Option<Self> {
        match sf {
            7 => Some(Self::Sf7),
            8 => Some(Self::Sf8),
            9 => Some(Self::Sf9),
            10 => Some(Self::Sf10),
            _ => None,
        }
    }

    /// Like `from_spreading_factor`, falling back to the default rate
    pub fn from_spreading_factor_or_default(sf: u8) -> Self {
        Self::from_spreading_factor(sf).unwrap_or_default()
    }
}

impl Default for DataRate {
    fn default() -> Self {
        Self::from_spreading_factor(lora_defaults::SPREADING_FACTOR).unwrap_or(Self::Sf10)
    }
}

/// Duty-cycle band a channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// 1% duty cycle
    Centi,
    /// 0.1% duty cycle
    Milli,
}

/// One uplink channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub frequency_hz: u32,
    pub min_rate: DataRate,
    pub max_rate: DataRate,
    pub band: Band,
}

impl Channel {
    const fn new(frequency_hz: u32, min_rate: DataRate, max_rate: DataRate, band: Band) -> Self {
        Self {
            frequency_hz,
            min_rate,
            max_rate,
            band,
        }
    }
}

/// Channels and sub-band configured before every join or activation
#[derive(Debug, Clone, Copy)]
pub struct ChannelPlan {
    pub channels: &'static [Channel],
    pub sub_band: u8,
}

/// Gateway-default EU868 channels
pub const EU868_CHANNELS: [Channel; 9] = [
    Channel::new(868_100_000, DataRate::Sf12, DataRate::Sf7, Band::Centi),
    Channel::new(868_300_000, DataRate::Sf12, DataRate::Sf7Bw250, Band::Centi),
    Channel::new(868_500_000, DataRate::Sf12, DataRate::Sf7, Band::Centi),
    Channel::new(867_100_000, DataRate::Sf12, DataRate::Sf7, Band::Centi),
    Channel::new(867_300_000, DataRate::Sf12, DataRate::Sf7, Band::Centi),
    Channel::new(867_500_000, DataRate::Sf12, DataRate::Sf7, Band::Centi),
    Channel::new(867_700_000, DataRate::Sf12, DataRate::Sf7, Band::Centi),
    Channel::new(867_900_000, DataRate::Sf12, DataRate::Sf7, Band::Centi),
    Channel::new(868_800_000, DataRate::Fsk, DataRate::Fsk, Band::Milli),
];

impl Default for ChannelPlan {
    fn default() -> Self {
        Self {
            channels: &EU868_CHANNELS,
            sub_band: lora_defaults::SUB_BAND,
        }
    }
}
