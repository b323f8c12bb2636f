pub mod config;
pub mod store;
pub mod vehicle;

pub use config::{ManagerConfig, PrimaryConfig, ScheduleSettings, VehicleConfig};
pub use store::TomlSettingsStore;
pub use vehicle::HttpVehicleControl;
