use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operator-tunable power settings. These survive restarts through a
/// [`SettingsStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    /// Site-wide charging budget in whole amps.
    pub available_amps: u16,
    pub power_offset_watts: i64,
    pub enable_solar: bool,
    pub check_interval_minutes: u32,
    pub auto_start_stop: bool,
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            available_amps: 0,
            power_offset_watts: 0,
            enable_solar: false,
            check_interval_minutes: 1,
            auto_start_stop: false,
        }
    }
}

/// How an operator expresses the power offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerOffset {
    Watts(i64),
    Amps(i64),
}

/// Partial update of [`PowerSettings`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerSettingsUpdate {
    pub power_offset: Option<PowerOffset>,
    pub enable_solar: Option<bool>,
    pub check_interval_minutes: Option<u32>,
    pub auto_start_stop: Option<bool>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to write settings to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode settings: {0}")]
    Encode(String),
}

/// Persistence for [`PowerSettings`].
pub trait SettingsStore: Send + Sync {
    fn save(&self, settings: &PowerSettings) -> Result<(), SettingsError>;
}
