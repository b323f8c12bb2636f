use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

/// Two-byte identifier of a wall connector (primary or secondary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct TwcId(pub [u8; 2]);

impl TwcId {
    pub const fn new(hi: u8, lo: u8) -> Self {
        Self([hi, lo])
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [hi, lo, ..] => Some(Self([*hi, *lo])),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }
}

impl fmt::Display for TwcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}", self.0[0], self.0[1])
    }
}

impl Serialize for TwcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTwcIdError(pub String);

impl fmt::Display for ParseTwcIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid twc id {:?}: expected 4 hex characters", self.0)
    }
}

impl std::error::Error for ParseTwcIdError {}

impl FromStr for TwcId {
    type Err = ParseTwcIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.len() != 4 || !trimmed.is_ascii() {
            return Err(ParseTwcIdError(value.to_string()));
        }
        let hi = u8::from_str_radix(&trimmed[0..2], 16)
            .map_err(|_| ParseTwcIdError(value.to_string()))?;
        let lo = u8::from_str_radix(&trimmed[2..4], 16)
            .map_err(|_| ParseTwcIdError(value.to_string()))?;
        Ok(Self([hi, lo]))
    }
}

/// Amperage in hundredths of an amp, as carried on the wire.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CentiAmps(pub u16);

impl CentiAmps {
    pub const ZERO: CentiAmps = CentiAmps(0);

    /// Whole amps to the wire representation, saturating at the 16-bit ceiling.
    pub fn from_amps(amps: u32) -> Self {
        Self(u16::try_from(amps.saturating_mul(100)).unwrap_or(u16::MAX))
    }

    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Truncating conversion to whole amps.
    pub fn whole_amps(self) -> u16 {
        self.0 / 100
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CentiAmps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}A", self.0 / 100, self.0 % 100)
    }
}

/// Whether a vehicle is connected to a secondary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlugState {
    #[default]
    Unplugged,
    PluggedCharging,
    PluggedNotCharging,
    Other(u8),
}

impl PlugState {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Unplugged,
            1 => Self::PluggedCharging,
            3 => Self::PluggedNotCharging,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Unplugged => 0,
            Self::PluggedCharging => 1,
            Self::PluggedNotCharging => 3,
            Self::Other(code) => code,
        }
    }

    /// True for the two states the charging path acts on.
    pub fn is_plugged(self) -> bool {
        matches!(self, Self::PluggedCharging | Self::PluggedNotCharging)
    }
}

/// Synthetic state reported for a secondary the controller has disabled.
pub const STATE_DISABLED: u8 = 99;

/// Human readable form of a secondary's reported state byte.
pub fn describe_state(code: u8) -> &'static str {
    match code {
        1 => "Charging",
        2 => "Error: Lost comms",
        3 => "Do not charge",
        4 => "Ready to charge",
        5 => "Busy",
        8 => "Preparing to charge",
        9 => "Adjusting charge rate",
        STATE_DISABLED => "Disabled by controller",
        _ => "Not charging",
    }
}

/// One site meter sample, in watts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteReading {
    pub load_watts: f64,
    pub solar_watts: f64,
}

/// Semantic events emitted by the controller for status indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    DeviceLinked { twc_id: TwcId },
    DeviceEvicted { twc_id: TwcId },
    PlugStateChanged { twc_id: TwcId, plug_state: PlugState },
    ChargingChanged { twc_id: TwcId, charging: bool },
    ForeignPrimaryDetected { twc_id: TwcId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twc_id_parses_and_formats_hex() {
        let id: TwcId = "ab0c".parse().expect("parse");
        assert_eq!(id, TwcId::new(0xab, 0x0c));
        assert_eq!(id.to_string(), "ab0c");
        assert!("abc".parse::<TwcId>().is_err());
        assert!("zz00".parse::<TwcId>().is_err());
    }

    #[test]
    fn centi_amps_conversions() {
        assert_eq!(CentiAmps::from_amps(80), CentiAmps(8000));
        assert_eq!(CentiAmps::from_be_bytes([0x1f, 0x40]).whole_amps(), 80);
        assert_eq!(CentiAmps(1250).to_string(), "12.50A");
        assert_eq!(CentiAmps::from_amps(1_000), CentiAmps(u16::MAX));
    }

    #[test]
    fn plug_state_codes() {
        assert!(PlugState::from_code(1).is_plugged());
        assert!(PlugState::from_code(3).is_plugged());
        assert!(!PlugState::from_code(0).is_plugged());
        assert_eq!(PlugState::from_code(7), PlugState::Other(7));
        assert_eq!(describe_state(STATE_DISABLED), "Disabled by controller");
    }
}
