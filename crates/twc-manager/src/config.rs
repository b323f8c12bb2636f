use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use primary::{ChargeWorkerConfig, ControllerConfig, PowerSettings, ScheduleConfig};
use serial_link::SerialConfig;
use site_meter::MeterConfig;
use types::TwcId;

const DEFAULT_SETTINGS_PATH: &str = "twc-settings.toml";
const DEFAULT_VEHICLE_TIMEOUT_MS: u64 = 10_000;

/// Installation parameters of the primary, as configured.
#[derive(Clone, Debug)]
pub struct PrimaryConfig {
    pub id: String,
    pub signature: u8,
    pub wiring_max_amps_total: u16,
    pub wiring_max_amps_per_device: u16,
    pub min_amps_per_device: u16,
    pub supply_voltage: u16,
    pub supply_phases: u8,
    pub tick_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub link_ready_pacing_ms: u64,
    pub eviction_timeout_secs: u64,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            id: "7777".to_string(),
            signature: 0x77,
            wiring_max_amps_total: 32,
            wiring_max_amps_per_device: 32,
            min_amps_per_device: 6,
            supply_voltage: 240,
            supply_phases: 1,
            tick_ms: 25,
            heartbeat_interval_ms: 1_000,
            link_ready_pacing_ms: 100,
            eviction_timeout_secs: 26,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScheduleSettings {
    pub vin_poll_secs: u64,
    pub plug_state_poll_secs: u64,
    pub stats_poll_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            vin_poll_secs: 5,
            plug_state_poll_secs: 10,
            stats_poll_secs: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VehicleConfig {
    /// Endpoint of the vehicle charge-control service.
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub serial: SerialConfig,
    pub primary: PrimaryConfig,
    /// Startup values for the operator-tunable settings; a saved settings
    /// file takes precedence.
    pub power: PowerSettings,
    pub schedule: ScheduleSettings,
    pub meter: Option<MeterConfig>,
    pub vehicle: Option<VehicleConfig>,
    pub charging: ChargeWorkerConfig,
    pub settings_path: String,
    pub metrics_listen: Option<String>,
}

impl ManagerConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            anyhow::bail!("serial.port must be non-empty");
        }
        if self.serial.baud_rate == 0 {
            anyhow::bail!("serial.baud_rate must be >= 1");
        }
        if self.serial.read_timeout_ms == 0 {
            anyhow::bail!("serial.read_timeout_ms must be >= 1");
        }
        if self.serial.max_read_bytes == 0 {
            anyhow::bail!("serial.max_read_bytes must be >= 1");
        }
        self.primary_id()?;
        if !(100..=260).contains(&self.primary.supply_voltage) {
            anyhow::bail!("primary.supply_voltage must be between 100 and 260");
        }
        if !matches!(self.primary.supply_phases, 1 | 3) {
            anyhow::bail!("primary.supply_phases must be 1 or 3");
        }
        if self.primary.min_amps_per_device == 0 {
            anyhow::bail!("primary.min_amps_per_device must be >= 1");
        }
        if self.primary.wiring_max_amps_per_device > self.primary.wiring_max_amps_total {
            anyhow::bail!(
                "primary.wiring_max_amps_per_device must not exceed primary.wiring_max_amps_total"
            );
        }
        if self.primary.tick_ms == 0 {
            anyhow::bail!("primary.tick_ms must be >= 1");
        }
        if self.primary.heartbeat_interval_ms == 0 {
            anyhow::bail!("primary.heartbeat_interval_ms must be >= 1");
        }
        if self.primary.link_ready_pacing_ms == 0 {
            anyhow::bail!("primary.link_ready_pacing_ms must be >= 1");
        }
        if self.primary.eviction_timeout_secs == 0 {
            anyhow::bail!("primary.eviction_timeout_secs must be >= 1");
        }
        if self.power.check_interval_minutes == 0 {
            anyhow::bail!("power.check_interval_minutes must be >= 1");
        }
        if self.schedule.vin_poll_secs == 0
            || self.schedule.plug_state_poll_secs == 0
            || self.schedule.stats_poll_secs == 0
        {
            anyhow::bail!("schedule poll intervals must be >= 1");
        }
        if let Some(ref meter) = self.meter {
            validate_http_url("meter.url", &meter.url)?;
            if meter.poll_interval_ms == 0 {
                anyhow::bail!("meter.poll_interval_ms must be >= 1");
            }
            if meter.timeout_ms == 0 {
                anyhow::bail!("meter.timeout_ms must be >= 1");
            }
        }
        if let Some(ref vehicle) = self.vehicle {
            validate_http_url("vehicle.url", &vehicle.url)?;
        }
        if self.charging.max_attempts == 0 {
            anyhow::bail!("charging.retry_count must be >= 1");
        }
        if self.settings_path.trim().is_empty() {
            anyhow::bail!("settings_path must be non-empty");
        }
        if let Some(ref listen) = self.metrics_listen {
            listen
                .parse::<SocketAddr>()
                .with_context(|| format!("metrics_listen {listen:?} is not a socket address"))?;
        }

        Ok(())
    }

    pub fn primary_id(&self) -> Result<TwcId> {
        self.primary
            .id
            .parse::<TwcId>()
            .map_err(|err| anyhow::anyhow!("primary.id: {err}"))
    }

    pub fn controller_config(&self) -> Result<ControllerConfig> {
        Ok(ControllerConfig {
            primary_id: self.primary_id()?,
            signature: self.primary.signature,
            wiring_max_amps_total: self.primary.wiring_max_amps_total,
            wiring_max_amps_per_device: self.primary.wiring_max_amps_per_device,
            min_amps_per_device: self.primary.min_amps_per_device,
            supply_voltage: self.primary.supply_voltage,
            supply_phases: self.primary.supply_phases,
            tick: Duration::from_millis(self.primary.tick_ms),
            heartbeat_interval: Duration::from_millis(self.primary.heartbeat_interval_ms),
            link_ready_pacing: Duration::from_millis(self.primary.link_ready_pacing_ms),
            eviction_timeout: Duration::from_secs(self.primary.eviction_timeout_secs),
            schedule: ScheduleConfig {
                vin_poll: Duration::from_secs(self.schedule.vin_poll_secs),
                plug_state_poll: Duration::from_secs(self.schedule.plug_state_poll_secs),
                stats_poll: Duration::from_secs(self.schedule.stats_poll_secs),
            },
        })
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            primary: PrimaryConfig::default(),
            power: PowerSettings::default(),
            schedule: ScheduleSettings::default(),
            meter: None,
            vehicle: None,
            charging: ChargeWorkerConfig::default(),
            settings_path: DEFAULT_SETTINGS_PATH.to_string(),
            metrics_listen: None,
        }
    }
}

fn validate_http_url(field: &str, url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("{field} must start with http:// or https://");
    }
    Ok(())
}

fn apply_env_overrides(config: &mut ManagerConfig) {
    if let Ok(value) = env::var("TWC_SERIAL_PORT") {
        config.serial.port = value;
    }
    if let Some(baud) = parse_env_u32("TWC_BAUD_RATE") {
        config.serial.baud_rate = baud;
    }

    if let Ok(value) = env::var("TWC_PRIMARY_ID") {
        config.primary.id = value;
    }
    if let Some(amps) = parse_env_u16("TWC_WIRING_MAX_AMPS_TOTAL") {
        config.primary.wiring_max_amps_total = amps;
    }
    if let Some(amps) = parse_env_u16("TWC_WIRING_MAX_AMPS_PER_DEVICE") {
        config.primary.wiring_max_amps_per_device = amps;
    }
    if let Some(amps) = parse_env_u16("TWC_MIN_AMPS_PER_DEVICE") {
        config.primary.min_amps_per_device = amps;
    }
    if let Some(volts) = parse_env_u16("TWC_SUPPLY_VOLTAGE") {
        config.primary.supply_voltage = volts;
    }
    if let Some(phases) = parse_env_u16("TWC_SUPPLY_PHASES") {
        config.primary.supply_phases = u8::try_from(phases).unwrap_or(u8::MAX);
    }
    if let Some(tick_ms) = parse_env_u64("TWC_TICK_MS") {
        config.primary.tick_ms = tick_ms;
    }

    if let Some(amps) = parse_env_u16("TWC_AVAILABLE_AMPS") {
        config.power.available_amps = amps;
    }
    if let Some(enable) = parse_env_bool("TWC_ENABLE_SOLAR") {
        config.power.enable_solar = enable;
    }
    if let Some(watts) = parse_env_i64("TWC_POWER_OFFSET_WATTS") {
        config.power.power_offset_watts = watts;
    }
    if let Some(minutes) = parse_env_u32("TWC_CHECK_INTERVAL_MINUTES") {
        config.power.check_interval_minutes = minutes;
    }
    if let Some(enable) = parse_env_bool("TWC_AUTO_START_STOP") {
        config.power.auto_start_stop = enable;
    }

    if let Ok(url) = env::var("TWC_METER_URL") {
        let meter = config.meter.get_or_insert_with(MeterConfig::default);
        meter.url = url;
    }
    if let Ok(url) = env::var("TWC_VEHICLE_URL") {
        config.vehicle = Some(VehicleConfig {
            url,
            timeout_ms: config
                .vehicle
                .as_ref()
                .map_or(DEFAULT_VEHICLE_TIMEOUT_MS, |vehicle| vehicle.timeout_ms),
        });
    }

    if let Ok(path) = env::var("TWC_SETTINGS_PATH") {
        config.settings_path = path;
    }
    config.metrics_listen = env::var("TWC_METRICS_LISTEN").ok().or(config.metrics_listen.take());
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok()?.parse().ok()
}

fn parse_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok()?.parse().ok()
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok()?.parse().ok()
}

fn parse_env_i64(key: &str) -> Option<i64> {
    env::var(key).ok()?.parse().ok()
}

fn parse_env_bool(key: &str) -> Option<bool> {
    match env::var(key).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    serial: Option<FileSerialConfig>,
    primary: Option<FilePrimaryConfig>,
    power: Option<FilePowerConfig>,
    schedule: Option<FileScheduleConfig>,
    meter: Option<FileMeterConfig>,
    vehicle: Option<FileVehicleConfig>,
    charging: Option<FileChargingConfig>,
    settings_path: Option<String>,
    metrics_listen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileSerialConfig {
    port: Option<String>,
    baud_rate: Option<u32>,
    read_timeout_ms: Option<u64>,
    max_read_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FilePrimaryConfig {
    id: Option<String>,
    signature: Option<u8>,
    wiring_max_amps_total: Option<u16>,
    wiring_max_amps_per_device: Option<u16>,
    min_amps_per_device: Option<u16>,
    supply_voltage: Option<u16>,
    supply_phases: Option<u8>,
    available_amps: Option<u16>,
    tick_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    link_ready_pacing_ms: Option<u64>,
    eviction_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilePowerConfig {
    enable_solar: Option<bool>,
    check_interval_minutes: Option<u32>,
    power_offset_watts: Option<i64>,
    auto_start_stop: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileScheduleConfig {
    vin_poll_secs: Option<u64>,
    plug_state_poll_secs: Option<u64>,
    stats_poll_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileMeterConfig {
    url: String,
    poll_interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileVehicleConfig {
    url: String,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileChargingConfig {
    retry_count: Option<u32>,
    retry_delay_ms: Option<u64>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("TWC_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut ManagerConfig, file: FileConfig) {
    if let Some(serial) = file.serial {
        if let Some(port) = serial.port {
            config.serial.port = port;
        }
        if let Some(baud) = serial.baud_rate {
            config.serial.baud_rate = baud;
        }
        if let Some(timeout) = serial.read_timeout_ms {
            config.serial.read_timeout_ms = timeout;
        }
        if let Some(max) = serial.max_read_bytes {
            config.serial.max_read_bytes = max;
        }
    }

    if let Some(primary) = file.primary {
        if let Some(id) = primary.id {
            config.primary.id = id;
        }
        if let Some(signature) = primary.signature {
            config.primary.signature = signature;
        }
        if let Some(amps) = primary.wiring_max_amps_total {
            config.primary.wiring_max_amps_total = amps;
        }
        if let Some(amps) = primary.wiring_max_amps_per_device {
            config.primary.wiring_max_amps_per_device = amps;
        }
        if let Some(amps) = primary.min_amps_per_device {
            config.primary.min_amps_per_device = amps;
        }
        if let Some(volts) = primary.supply_voltage {
            config.primary.supply_voltage = volts;
        }
        if let Some(phases) = primary.supply_phases {
            config.primary.supply_phases = phases;
        }
        if let Some(amps) = primary.available_amps {
            config.power.available_amps = amps;
        }
        if let Some(tick) = primary.tick_ms {
            config.primary.tick_ms = tick;
        }
        if let Some(interval) = primary.heartbeat_interval_ms {
            config.primary.heartbeat_interval_ms = interval;
        }
        if let Some(pacing) = primary.link_ready_pacing_ms {
            config.primary.link_ready_pacing_ms = pacing;
        }
        if let Some(timeout) = primary.eviction_timeout_secs {
            config.primary.eviction_timeout_secs = timeout;
        }
    }

    if let Some(power) = file.power {
        if let Some(enable) = power.enable_solar {
            config.power.enable_solar = enable;
        }
        if let Some(minutes) = power.check_interval_minutes {
            config.power.check_interval_minutes = minutes;
        }
        if let Some(watts) = power.power_offset_watts {
            config.power.power_offset_watts = watts;
        }
        if let Some(enable) = power.auto_start_stop {
            config.power.auto_start_stop = enable;
        }
    }

    if let Some(schedule) = file.schedule {
        if let Some(secs) = schedule.vin_poll_secs {
            config.schedule.vin_poll_secs = secs;
        }
        if let Some(secs) = schedule.plug_state_poll_secs {
            config.schedule.plug_state_poll_secs = secs;
        }
        if let Some(secs) = schedule.stats_poll_secs {
            config.schedule.stats_poll_secs = secs;
        }
    }

    if let Some(meter) = file.meter {
        let defaults = MeterConfig::default();
        config.meter = Some(MeterConfig {
            url: meter.url,
            poll_interval_ms: meter.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            timeout_ms: meter.timeout_ms.unwrap_or(defaults.timeout_ms),
        });
    }

    if let Some(vehicle) = file.vehicle {
        config.vehicle = Some(VehicleConfig {
            url: vehicle.url,
            timeout_ms: vehicle.timeout_ms.unwrap_or(DEFAULT_VEHICLE_TIMEOUT_MS),
        });
    }

    if let Some(charging) = file.charging {
        if let Some(count) = charging.retry_count {
            config.charging.max_attempts = count;
        }
        if let Some(delay) = charging.retry_delay_ms {
            config.charging.retry_delay = Duration::from_millis(delay);
        }
    }

    if let Some(path) = file.settings_path {
        config.settings_path = path;
    }
    if let Some(listen) = file.metrics_listen {
        config.metrics_listen = Some(listen);
    }
}
