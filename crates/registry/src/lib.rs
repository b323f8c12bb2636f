use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use types::{describe_state, CentiAmps, PlugState, TwcId, STATE_DISABLED};

/// Length of a complete vehicle identifier.
pub const VIN_LEN: usize = 17;

/// Everything the primary knows about one secondary.
#[derive(Debug, Clone, Serialize)]
pub struct SecondaryDevice {
    pub id: TwcId,
    // Protocol 2 secondaries answer protocol 1 commands, so assume 1 until a
    // ready-to-link frame says otherwise.
    pub protocol_version: u8,
    pub min_amps_supported: u8,
    /// Per-device wiring ceiling in whole amps.
    pub wiring_max_amps: u16,
    pub reported_amps_max: CentiAmps,
    pub reported_amps_actual: CentiAmps,
    pub last_amps_offered: CentiAmps,
    /// Current allocation, carried in every heartbeat.
    pub available_amps: CentiAmps,
    pub reported_state: u8,
    pub allow_charge: bool,
    pub charge_state: bool,
    pub plug_state: PlugState,
    pub vin_start: String,
    pub vin_middle: String,
    pub vin_end: String,
    pub stats_kwh: u32,
    pub stats_watts: u32,
    pub phase_volts: [u16; 3],
    pub phase_amps: [u8; 3],
    #[serde(skip)]
    pub time_last_seen: Instant,
    pub last_seen_unix_ms: u64,
}

impl SecondaryDevice {
    pub fn new(id: TwcId, wiring_max_amps: u16, now: Instant) -> Self {
        Self {
            id,
            protocol_version: 1,
            min_amps_supported: 6,
            wiring_max_amps,
            reported_amps_max: CentiAmps::ZERO,
            reported_amps_actual: CentiAmps::ZERO,
            last_amps_offered: CentiAmps::ZERO,
            available_amps: CentiAmps::ZERO,
            reported_state: 0,
            allow_charge: true,
            charge_state: false,
            plug_state: PlugState::Unplugged,
            vin_start: String::new(),
            vin_middle: String::new(),
            vin_end: String::new(),
            stats_kwh: 0,
            stats_watts: 0,
            phase_volts: [0; 3],
            phase_amps: [0; 3],
            time_last_seen: now,
            last_seen_unix_ms: unix_ms(),
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.time_last_seen = now;
        self.last_seen_unix_ms = unix_ms();
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.time_last_seen) >= timeout
    }

    /// Still at the defaults assigned on creation.
    pub fn has_default_protocol(&self) -> bool {
        self.protocol_version == 1 && self.min_amps_supported == 6
    }

    /// The assembled vehicle identifier, when all three fragments are known.
    pub fn vin(&self) -> Option<String> {
        let vin = format!("{}{}{}", self.vin_start, self.vin_middle, self.vin_end);
        (vin.len() == VIN_LEN).then_some(vin)
    }

    /// Mask telemetry for a secondary the controller has switched off.
    pub fn apply_disabled_gate(&mut self) {
        if !self.allow_charge {
            self.reported_state = STATE_DISABLED;
            self.reported_amps_actual = CentiAmps::ZERO;
            self.reported_amps_max = CentiAmps::ZERO;
        }
    }

    pub fn state_description(&self) -> &'static str {
        describe_state(self.reported_state)
    }
}

/// Ordered set of known secondaries; insertion order drives the heartbeat
/// round robin.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<SecondaryDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, id: TwcId) -> Option<usize> {
        self.devices.iter().position(|device| device.id == id)
    }

    pub fn lookup(&self, id: TwcId) -> Option<&SecondaryDevice> {
        self.devices.iter().find(|device| device.id == id)
    }

    pub fn lookup_mut(&mut self, id: TwcId) -> Option<&mut SecondaryDevice> {
        self.devices.iter_mut().find(|device| device.id == id)
    }

    /// Return the device for `id`, creating it with protocol defaults if absent.
    ///
    /// The flag is true when the device was created by this call.
    pub fn upsert(
        &mut self,
        id: TwcId,
        wiring_max_amps: u16,
        now: Instant,
    ) -> (&mut SecondaryDevice, bool) {
        let (index, created) = match self.position(id) {
            Some(index) => (index, false),
            None => {
                debug!(twc_id = %id, "registering new secondary");
                self.devices
                    .push(SecondaryDevice::new(id, wiring_max_amps, now));
                (self.devices.len() - 1, true)
            }
        };
        (&mut self.devices[index], created)
    }

    /// Swap-remove the device at `index`; the last device takes its slot.
    pub fn remove(&mut self, index: usize) -> Option<SecondaryDevice> {
        if index >= self.devices.len() {
            return None;
        }
        Some(self.devices.swap_remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&SecondaryDevice> {
        self.devices.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SecondaryDevice> {
        self.devices.get_mut(index)
    }

    pub fn all(&self) -> &[SecondaryDevice] {
        &self.devices
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SecondaryDevice> {
        self.devices.iter_mut()
    }

    pub fn ids(&self) -> Vec<TwcId> {
        self.devices.iter().map(|device| device.id).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Sum of the charging power the secondaries last reported.
    pub fn total_watts(&self) -> u64 {
        self.devices
            .iter()
            .map(|device| u64::from(device.stats_watts))
            .sum()
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
