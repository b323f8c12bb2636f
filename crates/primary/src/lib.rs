//! Primary side of the TWC load-sharing bus.
//!
//! [`PrimaryController`] drives the link handshake, heartbeats every known
//! secondary in turn, tracks their telemetry and divides the site charging
//! budget between them.

use std::time::Duration;

use thiserror::Error;

use serial_link::LinkError;
use types::TwcId;

pub mod allocation;
pub mod charging;
pub mod controller;
pub mod handle;
pub mod scheduler;
pub mod settings;

pub use charging::{
    ChargeError, ChargeOutcome, ChargeRequest, ChargeWorker, ChargeWorkerConfig,
    VehicleControl, VehicleError,
};
pub use controller::{LinkState, PrimaryController, LINK_READY_MESSAGES};
pub use handle::{ControlCommand, ControllerHandle};
pub use scheduler::{ScheduleConfig, ScheduledAction, Scheduler};
pub use settings::{PowerOffset, PowerSettings, PowerSettingsUpdate, SettingsError, SettingsStore};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("failed to persist settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("invalid controller configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    #[error("controller is not running")]
    Stopped,
}

/// Fixed installation parameters of the primary.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub primary_id: TwcId,
    pub signature: u8,
    pub wiring_max_amps_total: u16,
    pub wiring_max_amps_per_device: u16,
    pub min_amps_per_device: u16,
    pub supply_voltage: u16,
    pub supply_phases: u8,
    pub tick: Duration,
    pub heartbeat_interval: Duration,
    pub link_ready_pacing: Duration,
    pub eviction_timeout: Duration,
    pub schedule: ScheduleConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            primary_id: TwcId::new(0x77, 0x77),
            signature: 0x77,
            wiring_max_amps_total: 32,
            wiring_max_amps_per_device: 32,
            min_amps_per_device: 6,
            supply_voltage: 240,
            supply_phases: 1,
            tick: Duration::from_millis(25),
            heartbeat_interval: Duration::from_secs(1),
            link_ready_pacing: Duration::from_millis(100),
            eviction_timeout: Duration::from_secs(26),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ControlError> {
        if !(100..=260).contains(&self.supply_voltage) {
            return Err(ControlError::InvalidConfig(format!(
                "supply voltage {} outside 100-260",
                self.supply_voltage
            )));
        }
        if !matches!(self.supply_phases, 1 | 3) {
            return Err(ControlError::InvalidConfig(format!(
                "supply phases must be 1 or 3, got {}",
                self.supply_phases
            )));
        }
        if self.min_amps_per_device == 0 {
            return Err(ControlError::InvalidConfig(
                "min amps per device must be > 0".to_string(),
            ));
        }
        if self.wiring_max_amps_per_device > self.wiring_max_amps_total {
            return Err(ControlError::InvalidConfig(
                "per-device wiring limit exceeds the total".to_string(),
            ));
        }
        if self.tick.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(ControlError::InvalidConfig(
                "tick and heartbeat intervals must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
