use tokio::sync::{broadcast, mpsc, oneshot, watch};

use registry::SecondaryDevice;
use twc_protocol::PollKind;
use types::{StatusEvent, TwcId};

use crate::settings::{PowerSettings, PowerSettingsUpdate};
use crate::ControlError;

pub(crate) type Reply = oneshot::Sender<Result<(), ControlError>>;

/// Operator requests, applied by the controller between ticks.
#[derive(Debug)]
pub enum ControlCommand {
    SetMaxAmps { amps: i64, reply: Reply },
    SetMaxWatts { watts: f64, reply: Reply },
    UpdatePowerSettings { update: PowerSettingsUpdate, reply: Reply },
    StartCharging { twc_id: TwcId, reply: Reply },
    StopCharging { twc_id: TwcId, reply: Reply },
    EnableDevice { twc_id: TwcId, reply: Reply },
    DisableDevice { twc_id: TwcId, reply: Reply },
    Poll { kinds: Vec<PollKind>, reply: Reply },
}

impl ControlCommand {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ControlCommand::SetMaxAmps { .. } => "set_max_amps",
            ControlCommand::SetMaxWatts { .. } => "set_max_watts",
            ControlCommand::UpdatePowerSettings { .. } => "update_power_settings",
            ControlCommand::StartCharging { .. } => "start_charging",
            ControlCommand::StopCharging { .. } => "stop_charging",
            ControlCommand::EnableDevice { .. } => "enable_device",
            ControlCommand::DisableDevice { .. } => "disable_device",
            ControlCommand::Poll { .. } => "poll",
        }
    }
}

/// Cloneable front door to a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    pub(crate) commands: mpsc::Sender<ControlCommand>,
    pub(crate) devices: watch::Receiver<Vec<SecondaryDevice>>,
    pub(crate) settings: watch::Receiver<PowerSettings>,
    pub(crate) events: broadcast::Sender<StatusEvent>,
}

impl ControllerHandle {
    pub async fn set_max_amps(&self, amps: i64) -> Result<(), ControlError> {
        self.request(|reply| ControlCommand::SetMaxAmps { amps, reply })
            .await
    }

    pub async fn set_max_watts(&self, watts: f64) -> Result<(), ControlError> {
        self.request(|reply| ControlCommand::SetMaxWatts { watts, reply })
            .await
    }

    pub async fn update_power_settings(
        &self,
        update: PowerSettingsUpdate,
    ) -> Result<(), ControlError> {
        self.request(|reply| ControlCommand::UpdatePowerSettings { update, reply })
            .await
    }

    pub async fn start_charging(&self, twc_id: TwcId) -> Result<(), ControlError> {
        self.request(|reply| ControlCommand::StartCharging { twc_id, reply })
            .await
    }

    pub async fn stop_charging(&self, twc_id: TwcId) -> Result<(), ControlError> {
        self.request(|reply| ControlCommand::StopCharging { twc_id, reply })
            .await
    }

    pub async fn enable_device(&self, twc_id: TwcId) -> Result<(), ControlError> {
        self.request(|reply| ControlCommand::EnableDevice { twc_id, reply })
            .await
    }

    pub async fn disable_device(&self, twc_id: TwcId) -> Result<(), ControlError> {
        self.request(|reply| ControlCommand::DisableDevice { twc_id, reply })
            .await
    }

    /// Ask every active secondary for its VIN fragments.
    pub async fn poll_vin(&self) -> Result<(), ControlError> {
        let kinds = vec![PollKind::VinStart, PollKind::VinMiddle, PollKind::VinEnd];
        self.request(|reply| ControlCommand::Poll { kinds, reply })
            .await
    }

    pub async fn poll_plug_state(&self) -> Result<(), ControlError> {
        let kinds = vec![PollKind::PlugState];
        self.request(|reply| ControlCommand::Poll { kinds, reply })
            .await
    }

    /// Registry contents as of the last controller tick.
    pub fn snapshot(&self) -> Vec<SecondaryDevice> {
        self.devices.borrow().clone()
    }

    pub fn power_settings(&self) -> PowerSettings {
        self.settings.borrow().clone()
    }

    pub fn watch_devices(&self) -> watch::Receiver<Vec<SecondaryDevice>> {
        self.devices.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    async fn request<F>(&self, build: F) -> Result<(), ControlError>
    where
        F: FnOnce(Reply) -> ControlCommand,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ControlError::Stopped)?;
        response.await.map_err(|_| ControlError::Stopped)?
    }
}
