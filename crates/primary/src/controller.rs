use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

use registry::{DeviceRegistry, SecondaryDevice};
use serial_link::{FramedLink, LinkError};
use twc_protocol::{
    heartbeat_data, hex_dump, Command, Message, PollData, PollKind, RateCommand, ReadyToLink,
    SecondaryHeartbeat, VinFragment,
};
use types::{CentiAmps, PlugState, SiteReading, StatusEvent, TwcId};

use crate::allocation::{
    amps_to_watts, equal_share, fixed_budget, solar_budget, supply_volts, BudgetDecision,
    SolarInput,
};
use crate::charging::{ChargeOutcome, ChargeRequest};
use crate::handle::{ControlCommand, ControllerHandle};
use crate::scheduler::{ScheduledAction, Scheduler};
use crate::settings::{PowerOffset, PowerSettings, PowerSettingsUpdate, SettingsStore};
use crate::{ControlError, ControllerConfig};

/// Link-ready messages sent after startup (or a re-arm) before heartbeats.
pub const LINK_READY_MESSAGES: u8 = 10;
/// While more than this many remain, the first link-ready variant is sent.
const LINK_READY_1_THRESHOLD: u8 = 5;

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Handshaking { remaining: u8 },
    Operational,
}

struct VehicleChannels {
    requests: mpsc::Sender<ChargeRequest>,
    outcomes: mpsc::Receiver<ChargeOutcome>,
}

/// The bus master: owns the link, the registry and the charging budget.
///
/// All protocol state is touched from one task only. Operator requests arrive
/// through a [`ControllerHandle`], vehicle-side results through the charge
/// worker's outcome channel, and both are applied between ticks.
pub struct PrimaryController<S> {
    config: ControllerConfig,
    settings: PowerSettings,
    store: Box<dyn SettingsStore>,
    link: FramedLink<S>,
    registry: DeviceRegistry,
    pending_link_ready: u8,
    next_heartbeat: usize,
    last_link_tx: Option<Instant>,
    scheduler: Scheduler,
    vehicle: Option<VehicleChannels>,
    pending_charge: HashMap<TwcId, bool>,
    meter: Option<watch::Receiver<Option<SiteReading>>>,
    commands: mpsc::Receiver<ControlCommand>,
    devices_tx: watch::Sender<Vec<SecondaryDevice>>,
    settings_tx: watch::Sender<PowerSettings>,
    events: broadcast::Sender<StatusEvent>,
}

impl<S> PrimaryController<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        link: FramedLink<S>,
        config: ControllerConfig,
        mut settings: PowerSettings,
        store: Box<dyn SettingsStore>,
    ) -> Result<(Self, ControllerHandle), ControlError> {
        config.validate()?;
        settings.available_amps = settings.available_amps.min(config.wiring_max_amps_total);
        settings.check_interval_minutes = settings.check_interval_minutes.max(1);

        let scheduler = Scheduler::new(
            &config.schedule,
            check_interval(settings.check_interval_minutes),
            Instant::now(),
        );
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (devices_tx, devices_rx) = watch::channel(Vec::new());
        let (settings_tx, settings_rx) = watch::channel(settings.clone());
        let (events, _) = broadcast::channel(EVENT_QUEUE);

        let handle = ControllerHandle {
            commands: commands_tx,
            devices: devices_rx,
            settings: settings_rx,
            events: events.clone(),
        };
        metrics::gauge!("twc_available_amps").set(f64::from(settings.available_amps));

        let controller = Self {
            config,
            settings,
            store,
            link,
            registry: DeviceRegistry::new(),
            pending_link_ready: LINK_READY_MESSAGES,
            next_heartbeat: 0,
            last_link_tx: None,
            scheduler,
            vehicle: None,
            pending_charge: HashMap::new(),
            meter: None,
            commands,
            devices_tx,
            settings_tx,
            events,
        };
        Ok((controller, handle))
    }

    /// Route start/stop through the vehicle API instead of the charger.
    pub fn with_vehicle_control(
        mut self,
        requests: mpsc::Sender<ChargeRequest>,
        outcomes: mpsc::Receiver<ChargeOutcome>,
    ) -> Self {
        self.vehicle = Some(VehicleChannels { requests, outcomes });
        self
    }

    pub fn with_site_meter(mut self, meter: watch::Receiver<Option<SiteReading>>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PowerSettings {
        &self.settings
    }

    pub fn link(&self) -> &FramedLink<S> {
        &self.link
    }

    pub fn link_state(&self) -> LinkState {
        if self.pending_link_ready > 0 {
            LinkState::Handshaking {
                remaining: self.pending_link_ready,
            }
        } else {
            LinkState::Operational
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControlError> {
        info!(
            primary_id = %self.config.primary_id,
            tick_ms = self.config.tick.as_millis() as u64,
            "primary controller started"
        );

        loop {
            tokio::select! {
                _ = sleep(self.config.tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("primary controller shutdown requested");
                        break;
                    }
                }
            }

            self.drain_commands().await;
            self.drain_charge_outcomes().await;

            let now = Instant::now();
            self.run_schedule(now).await;
            self.link_tick(now).await;

            let bodies = match self.link.receive().await {
                Ok(bodies) => bodies,
                Err(LinkError::Closed) => {
                    error!("serial link closed");
                    return Err(LinkError::Closed.into());
                }
                Err(err) => {
                    warn!(error = %err, "serial read failed");
                    Vec::new()
                }
            };

            let now = Instant::now();
            for body in bodies {
                self.handle_frame(&body, now).await;
            }
            self.publish_snapshot();
        }

        Ok(())
    }

    /// One transmit slot of the link state machine: a paced link-ready while
    /// handshaking, otherwise at most one heartbeat or eviction.
    pub async fn link_tick(&mut self, now: Instant) {
        if self.pending_link_ready > 0 {
            if !self.slot_open(now, self.config.link_ready_pacing) {
                return;
            }
            let primary = self.config.primary_id;
            let signature = self.config.signature;
            let command = if self.pending_link_ready > LINK_READY_1_THRESHOLD {
                Command::LinkReady1 { primary, signature }
            } else {
                Command::LinkReady2 { primary, signature }
            };
            self.pending_link_ready -= 1;
            self.last_link_tx = Some(now);
            debug!(
                command = command.name(),
                remaining = self.pending_link_ready,
                "link ready"
            );
            let _ = self.transmit(&command).await;
            if self.pending_link_ready == 0 {
                info!("link handshake complete");
            }
            return;
        }

        if self.registry.is_empty() {
            return;
        }
        if !self.slot_open(now, self.config.heartbeat_interval) {
            return;
        }
        if self.next_heartbeat >= self.registry.len() {
            self.next_heartbeat = 0;
        }

        let index = self.next_heartbeat;
        let stale = self
            .registry
            .get(index)
            .is_some_and(|device| device.is_stale(now, self.config.eviction_timeout));

        if stale {
            self.evict(index);
        } else {
            self.last_link_tx = Some(now);
            let _ = self.send_heartbeat(index).await;
        }

        self.next_heartbeat += 1;
        if self.next_heartbeat >= self.registry.len() {
            self.next_heartbeat = 0;
        }
    }

    pub async fn handle_frame(&mut self, body: &[u8], now: Instant) {
        match Message::parse(body) {
            Some(message) => self.handle_message(message, now).await,
            None => trace!(frame = %hex_dump(body), "unrecognised message"),
        }
    }

    pub async fn handle_message(&mut self, message: Message, now: Instant) {
        trace!(kind = message.kind(), twc_id = %message.twc_id(), "received");
        match message {
            Message::ReadyToLink(msg) => self.handle_ready_to_link(msg, now).await,
            Message::SecondaryHeartbeat(msg) => self.handle_heartbeat(msg, now),
            Message::PeriodicPollData(msg) => self.handle_poll_data(msg, now),
            Message::VinStart(fragment) => self.handle_vin(PollKind::VinStart, fragment, now),
            Message::VinMiddle(fragment) => self.handle_vin(PollKind::VinMiddle, fragment, now),
            Message::VinEnd(fragment) => self.handle_vin(PollKind::VinEnd, fragment, now),
            Message::PlugState { twc_id, plug_state } => {
                self.handle_plug_state(twc_id, plug_state, now).await
            }
            Message::PrimaryAnnounce { twc_id } => {
                error!(
                    twc_id = %twc_id,
                    "another primary is on the bus; secondaries will not follow this controller"
                );
                self.emit(StatusEvent::ForeignPrimaryDetected { twc_id });
            }
        }
    }

    pub async fn run_schedule(&mut self, now: Instant) {
        for action in self.scheduler.due(now) {
            let polled = match action {
                ScheduledAction::PollVinStart => self.poll_devices(PollKind::VinStart, true).await,
                ScheduledAction::PollVinMiddle => {
                    self.poll_devices(PollKind::VinMiddle, true).await
                }
                ScheduledAction::PollVinEnd => self.poll_devices(PollKind::VinEnd, true).await,
                ScheduledAction::PollPlugState => {
                    self.poll_devices(PollKind::PlugState, true).await
                }
                ScheduledAction::PollStats => self.poll_devices(PollKind::Stats, false).await,
                ScheduledAction::PowerCheck => {
                    self.power_check().await;
                    Ok(())
                }
            };
            if let Err(err) = polled {
                debug!(?action, error = %err, "scheduled poll abandoned");
            }
        }
    }

    /// Recompute the charging budget from the site meter (or the fixed
    /// budget). With auto start/stop on, apply it and start or stop connected
    /// vehicles; otherwise only log the decision.
    pub async fn power_check(&mut self) {
        let decision = match (&self.meter, self.settings.enable_solar) {
            (Some(meter), true) => {
                let reading = (*meter.borrow()).unwrap_or_default();
                let input = SolarInput {
                    load_watts: reading.load_watts,
                    solar_watts: reading.solar_watts,
                    charger_watts: self.registry.total_watts() as f64,
                    power_offset_watts: self.settings.power_offset_watts,
                    supply_voltage: self.config.supply_voltage,
                    supply_phases: self.config.supply_phases,
                    min_amps_per_device: self.config.min_amps_per_device,
                };
                debug!(
                    load_watts = input.load_watts,
                    solar_watts = input.solar_watts,
                    charger_watts = input.charger_watts,
                    solar_amps = input.solar_amps(),
                    offset_amps = input.offset_amps(),
                    "power check"
                );
                solar_budget(&input)
            }
            _ => fixed_budget(
                self.settings.available_amps,
                self.config.min_amps_per_device,
            ),
        };

        match decision {
            BudgetDecision::Charge { budget_amps, tier } => {
                // The budget is the operator's unless automatic start/stop is on.
                if !self.settings.auto_start_stop {
                    debug!(budget_amps, ?tier, "auto start/stop off; budget left unchanged");
                    return;
                }
                info!(budget_amps, ?tier, "enough power to charge");
                if let Err(err) = self.set_max_amps(budget_amps).await {
                    warn!(error = %err, "failed to apply charging budget");
                    return;
                }
                self.start_connected_cars().await;
            }
            BudgetDecision::Stop { shortfall_amps } => {
                info!(shortfall_amps, "not enough power for the minimum charge rate");
                if self.settings.auto_start_stop {
                    self.stop_connected_cars().await;
                }
            }
        }
    }

    /// Set the site budget, persist it and push the new shares to every
    /// secondary allowed to charge.
    pub async fn set_max_amps(&mut self, amps: i64) -> Result<(), ControlError> {
        let total = self.config.wiring_max_amps_total;
        let clamped = amps.clamp(0, i64::from(total)) as u16;
        if i64::from(clamped) != amps {
            debug!(requested = amps, applied = clamped, "budget clamped to wiring limit");
        }

        self.settings.available_amps = clamped;
        metrics::gauge!("twc_available_amps").set(f64::from(clamped));
        self.persist_settings()?;

        info!(
            available_amps = clamped,
            devices = self.registry.len(),
            "charging budget updated"
        );
        self.redistribute();

        let targets: Vec<(TwcId, CentiAmps)> = self
            .registry
            .all()
            .iter()
            .filter(|device| device.allow_charge)
            .map(|device| (device.id, device.available_amps))
            .collect();
        for (secondary, amps) in targets {
            let command = self.charge_rate(secondary, RateCommand::Set, amps);
            self.transmit(&command).await?;
        }
        Ok(())
    }

    pub async fn set_max_watts(&mut self, watts: f64) -> Result<(), ControlError> {
        let volts = supply_volts(self.config.supply_voltage, self.config.supply_phases);
        let amps = (watts.trunc() as i64) / volts;
        debug!(watts, amps, "converted watt budget");
        self.set_max_amps(amps).await
    }

    pub fn update_power_settings(&mut self, update: PowerSettingsUpdate) -> Result<(), ControlError> {
        if update.check_interval_minutes == Some(0) {
            return Err(ControlError::InvalidSetting(
                "check interval must be at least one minute".to_string(),
            ));
        }

        if let Some(offset) = update.power_offset {
            self.settings.power_offset_watts = match offset {
                PowerOffset::Watts(watts) => watts,
                PowerOffset::Amps(amps) => amps_to_watts(
                    amps,
                    self.config.supply_voltage,
                    self.config.supply_phases,
                ),
            };
        }
        if let Some(enable_solar) = update.enable_solar {
            self.settings.enable_solar = enable_solar;
        }
        if let Some(minutes) = update.check_interval_minutes {
            self.settings.check_interval_minutes = minutes;
            self.scheduler
                .set_interval(ScheduledAction::PowerCheck, check_interval(minutes));
        }
        if let Some(auto_start_stop) = update.auto_start_stop {
            self.settings.auto_start_stop = auto_start_stop;
        }

        info!(
            power_offset_watts = self.settings.power_offset_watts,
            enable_solar = self.settings.enable_solar,
            check_interval_minutes = self.settings.check_interval_minutes,
            auto_start_stop = self.settings.auto_start_stop,
            "power settings updated"
        );
        self.persist_settings()
    }

    pub async fn start_charging(&mut self, twc_id: TwcId) -> Result<(), ControlError> {
        self.change_charging(twc_id, true).await
    }

    pub async fn stop_charging(&mut self, twc_id: TwcId) -> Result<(), ControlError> {
        self.change_charging(twc_id, false).await
    }

    /// Start every connected secondary that is not charging yet.
    pub async fn start_connected_cars(&mut self) {
        let targets: Vec<TwcId> = self
            .registry
            .all()
            .iter()
            .filter(|device| !device.charge_state)
            .map(|device| device.id)
            .collect();
        for twc_id in targets {
            if let Err(err) = self.start_charging(twc_id).await {
                warn!(twc_id = %twc_id, error = %err, "failed to start charging");
            }
        }
    }

    pub async fn stop_connected_cars(&mut self) {
        let targets: Vec<TwcId> = self
            .registry
            .all()
            .iter()
            .filter(|device| device.charge_state)
            .map(|device| device.id)
            .collect();
        for twc_id in targets {
            if let Err(err) = self.stop_charging(twc_id).await {
                warn!(twc_id = %twc_id, error = %err, "failed to stop charging");
            }
        }
    }

    /// Let a secondary charge again, re-running the link handshake and
    /// re-sending rates and start to every allowed secondary.
    pub async fn enable_device(&mut self, twc_id: TwcId) -> Result<(), ControlError> {
        let Some(device) = self.registry.lookup_mut(twc_id) else {
            debug!(twc_id = %twc_id, "enable requested for unknown secondary");
            return Ok(());
        };
        device.allow_charge = true;
        info!(twc_id = %twc_id, "secondary enabled");

        self.pending_link_ready = LINK_READY_MESSAGES;
        self.redistribute();

        let targets: Vec<(TwcId, CentiAmps)> = self
            .registry
            .all()
            .iter()
            .filter(|device| device.allow_charge)
            .map(|device| (device.id, device.available_amps))
            .collect();
        for (secondary, amps) in targets {
            let rate = self.charge_rate(secondary, RateCommand::Set, amps);
            self.transmit(&rate).await?;
            let start = Command::Start {
                primary: self.config.primary_id,
                secondary,
            };
            self.transmit(&start).await?;
        }
        Ok(())
    }

    pub async fn disable_device(&mut self, twc_id: TwcId) -> Result<(), ControlError> {
        let Some(device) = self.registry.lookup_mut(twc_id) else {
            debug!(twc_id = %twc_id, "disable requested for unknown secondary");
            return Ok(());
        };
        device.allow_charge = false;
        info!(twc_id = %twc_id, "secondary disabled");

        let stop = Command::Stop {
            primary: self.config.primary_id,
            secondary: twc_id,
        };
        self.transmit(&stop).await?;
        Ok(())
    }

    /// Send a `kind` poll to each secondary; `active_only` skips secondaries
    /// whose reported state is still zero.
    pub async fn poll_devices(&mut self, kind: PollKind, active_only: bool) -> Result<(), LinkError> {
        let targets: Vec<TwcId> = self
            .registry
            .all()
            .iter()
            .filter(|device| !active_only || device.reported_state != 0)
            .map(|device| device.id)
            .collect();
        for secondary in targets {
            let command = Command::Poll {
                primary: self.config.primary_id,
                secondary,
                kind,
            };
            trace!(twc_id = %secondary, poll = kind.name(), "polling");
            self.transmit(&command).await?;
        }
        Ok(())
    }

    pub async fn apply_command(&mut self, command: ControlCommand) {
        let name = command.name();
        let (result, reply) = match command {
            ControlCommand::SetMaxAmps { amps, reply } => (self.set_max_amps(amps).await, reply),
            ControlCommand::SetMaxWatts { watts, reply } => {
                (self.set_max_watts(watts).await, reply)
            }
            ControlCommand::UpdatePowerSettings { update, reply } => {
                (self.update_power_settings(update), reply)
            }
            ControlCommand::StartCharging { twc_id, reply } => {
                (self.start_charging(twc_id).await, reply)
            }
            ControlCommand::StopCharging { twc_id, reply } => {
                (self.stop_charging(twc_id).await, reply)
            }
            ControlCommand::EnableDevice { twc_id, reply } => {
                (self.enable_device(twc_id).await, reply)
            }
            ControlCommand::DisableDevice { twc_id, reply } => {
                (self.disable_device(twc_id).await, reply)
            }
            ControlCommand::Poll { kinds, reply } => {
                let mut result = Ok(());
                for kind in kinds {
                    if let Err(err) = self.poll_devices(kind, true).await {
                        result = Err(err.into());
                        break;
                    }
                }
                (result, reply)
            }
        };

        if let Err(err) = &result {
            warn!(command = name, error = %err, "control command failed");
        }
        self.publish_snapshot();
        let _ = reply.send(result);
    }

    /// Apply a vehicle-side result. Failures leave the device untouched.
    pub async fn apply_charge_outcome(&mut self, outcome: ChargeOutcome) {
        let ChargeOutcome { request, result } = outcome;
        if self.pending_charge.get(&request.twc_id) == Some(&request.enable) {
            self.pending_charge.remove(&request.twc_id);
        }

        if let Err(err) = result {
            error!(
                twc_id = %request.twc_id,
                vin = %request.vin,
                enable = request.enable,
                error = %err,
                "vehicle did not accept charge request; state unchanged"
            );
            return;
        }

        let share = self.share_for(request.twc_id);
        let Some(device) = self.registry.lookup_mut(request.twc_id) else {
            debug!(twc_id = %request.twc_id, "secondary gone before charge outcome arrived");
            return;
        };
        device.allow_charge = true;
        let changed = device.charge_state != request.enable;
        device.charge_state = request.enable;
        if request.enable {
            device.available_amps = share;
        }
        info!(twc_id = %request.twc_id, enable = request.enable, "vehicle charge state changed");

        if changed {
            self.emit(StatusEvent::ChargingChanged {
                twc_id: request.twc_id,
                charging: request.enable,
            });
        }
        if request.enable {
            let command = self.charge_rate(request.twc_id, RateCommand::Set, share);
            let _ = self.transmit(&command).await;
        }
    }

    async fn handle_ready_to_link(&mut self, msg: ReadyToLink, now: Instant) {
        if msg.twc_id == self.config.primary_id {
            warn!(twc_id = %msg.twc_id, "secondary shares our id; restarting link handshake");
            self.pending_link_ready = LINK_READY_MESSAGES;
        }

        let (device, created) =
            self.registry
                .upsert(msg.twc_id, self.config.wiring_max_amps_per_device, now);
        device.touch(now);

        if device.has_default_protocol() {
            match msg.frame_len {
                14 => {
                    device.protocol_version = 1;
                    device.min_amps_supported = 5;
                }
                16 => {
                    device.protocol_version = 2;
                    device.min_amps_supported = 6;
                }
                _ => {}
            }
        }

        let hardware_max = msg.max_amps.whole_amps();
        let clamped = device.wiring_max_amps > hardware_max;
        if clamped {
            warn!(
                twc_id = %msg.twc_id,
                wiring_max_amps = device.wiring_max_amps,
                hardware_max_amps = hardware_max,
                "configured wiring limit exceeds what the secondary supports; clamping"
            );
            device.wiring_max_amps = hardware_max;
        }
        device.apply_disabled_gate();
        let protocol_version = device.protocol_version;

        if created {
            info!(twc_id = %msg.twc_id, protocol_version, "secondary linked");
            metrics::gauge!("twc_devices").set(self.registry.len() as f64);
            self.emit(StatusEvent::DeviceLinked { twc_id: msg.twc_id });
        }
        if created || clamped {
            self.redistribute();
        }

        if let Some(index) = self.registry.position(msg.twc_id) {
            let _ = self.send_heartbeat(index).await;
            // The reply occupies this slot of the half-duplex bus.
            self.last_link_tx = Some(now);
        }
    }

    fn handle_heartbeat(&mut self, msg: SecondaryHeartbeat, now: Instant) {
        if msg.primary_id != self.config.primary_id {
            debug!(
                twc_id = %msg.twc_id,
                primary_id = %msg.primary_id,
                "heartbeat addressed to another primary"
            );
            return;
        }
        let Some(device) = self.registry.lookup_mut(msg.twc_id) else {
            debug!(twc_id = %msg.twc_id, "heartbeat from unknown secondary");
            return;
        };

        device.touch(now);
        device.reported_state = msg.state;
        device.reported_amps_max = msg.amps_max;
        device.reported_amps_actual = msg.amps_actual;
        device.apply_disabled_gate();

        let charging = !device.reported_amps_actual.is_zero();
        let changed = device.charge_state != charging;
        device.charge_state = charging;
        debug!(
            twc_id = %msg.twc_id,
            state = device.state_description(),
            amps_max = %device.reported_amps_max,
            amps_actual = %device.reported_amps_actual,
            "secondary heartbeat"
        );

        if changed {
            self.emit(StatusEvent::ChargingChanged {
                twc_id: msg.twc_id,
                charging,
            });
        }
    }

    fn handle_poll_data(&mut self, msg: PollData, now: Instant) {
        let Some(device) = self.registry.lookup_mut(msg.twc_id) else {
            debug!(twc_id = %msg.twc_id, "stats from unknown secondary");
            return;
        };
        device.touch(now);
        device.stats_kwh = msg.kwh;
        device.phase_volts = msg.phase_volts;
        device.phase_amps = msg.phase_amps;

        let [v1, v2, v3] = msg.phase_volts.map(u32::from);
        let volts = if v2 != 0 && v3 != 0 { v1 + v2 + v3 } else { v1 };
        let watts = u64::from(volts) * u64::from(device.reported_amps_actual.0) / 100;
        device.stats_watts = u32::try_from(watts).unwrap_or(u32::MAX);
        trace!(
            twc_id = %msg.twc_id,
            kwh = device.stats_kwh,
            watts = device.stats_watts,
            "secondary stats"
        );
    }

    fn handle_vin(&mut self, kind: PollKind, fragment: VinFragment, now: Instant) {
        let Some(device) = self.registry.lookup_mut(fragment.twc_id) else {
            debug!(twc_id = %fragment.twc_id, "vin from unknown secondary");
            return;
        };
        device.touch(now);
        let text = fragment.text.unwrap_or_default();
        match kind {
            PollKind::VinStart => device.vin_start = text,
            PollKind::VinMiddle => device.vin_middle = text,
            PollKind::VinEnd => device.vin_end = text,
            PollKind::Stats | PollKind::PlugState => {}
        }
    }

    async fn handle_plug_state(&mut self, twc_id: TwcId, plug_state: PlugState, now: Instant) {
        let share = equal_share(self.settings.available_amps, self.registry.len()).unwrap_or(0);
        let headroom = self.headroom_for(twc_id);
        let min_amps = self.config.min_amps_per_device;

        let Some(device) = self.registry.lookup_mut(twc_id) else {
            debug!(twc_id = %twc_id, "plug state from unknown secondary");
            return;
        };
        device.touch(now);
        let previous = device.plug_state;
        device.plug_state = plug_state;

        let offer = if plug_state != PlugState::Unplugged && device.allow_charge {
            // A fresh plug-in starts at the minimum rate.
            let amps = if previous == PlugState::Unplugged {
                min_amps
            } else {
                share
            };
            let amps = amps.min(device.wiring_max_amps).min(headroom);
            let offer = CentiAmps::from_amps(u32::from(amps));
            device.available_amps = offer;
            Some(offer)
        } else {
            None
        };

        if previous != plug_state {
            info!(twc_id = %twc_id, ?previous, current = ?plug_state, "plug state changed");
            self.emit(StatusEvent::PlugStateChanged { twc_id, plug_state });
        }
        if let Some(amps) = offer {
            let command = self.charge_rate(twc_id, RateCommand::Set, amps);
            let _ = self.transmit(&command).await;
        }
    }

    async fn change_charging(&mut self, twc_id: TwcId, enable: bool) -> Result<(), ControlError> {
        let Some(device) = self.registry.lookup(twc_id) else {
            debug!(twc_id = %twc_id, enable, "charge change for unknown secondary ignored");
            return Ok(());
        };
        if !device.plug_state.is_plugged() {
            debug!(
                twc_id = %twc_id,
                plug_state = ?device.plug_state,
                "no vehicle plugged in; charge change ignored"
            );
            return Ok(());
        }
        let vin = device.vin();

        if let Some(vehicle) = &self.vehicle {
            let Some(vin) = vin else {
                debug!(twc_id = %twc_id, "vin not known yet; vehicle api not called");
                return Ok(());
            };
            if self.pending_charge.get(&twc_id) == Some(&enable) {
                trace!(twc_id = %twc_id, enable, "charge request already in flight");
                return Ok(());
            }
            match vehicle.requests.try_send(ChargeRequest { twc_id, vin, enable }) {
                Ok(()) => {
                    info!(twc_id = %twc_id, enable, "vehicle charge request queued");
                    self.pending_charge.insert(twc_id, enable);
                }
                Err(err) => {
                    warn!(twc_id = %twc_id, error = %err, "charge worker unavailable; request dropped");
                }
            }
            return Ok(());
        }

        if enable {
            self.start_at_charger(twc_id).await
        } else {
            self.stop_at_charger(twc_id).await
        }
    }

    async fn start_at_charger(&mut self, twc_id: TwcId) -> Result<(), ControlError> {
        let share = self.share_for(twc_id);
        let Some(device) = self.registry.lookup_mut(twc_id) else {
            return Ok(());
        };
        device.allow_charge = true;
        let changed = !device.charge_state;
        device.charge_state = true;
        device.available_amps = share;
        info!(twc_id = %twc_id, amps = %share, "starting charge at the secondary");
        if changed {
            self.emit(StatusEvent::ChargingChanged {
                twc_id,
                charging: true,
            });
        }

        let start = Command::Start {
            primary: self.config.primary_id,
            secondary: twc_id,
        };
        self.transmit(&start).await?;
        let rate = self.charge_rate(twc_id, RateCommand::Set, share);
        self.transmit(&rate).await?;
        Ok(())
    }

    async fn stop_at_charger(&mut self, twc_id: TwcId) -> Result<(), ControlError> {
        let Some(device) = self.registry.lookup_mut(twc_id) else {
            return Ok(());
        };
        device.allow_charge = false;
        let changed = device.charge_state;
        device.charge_state = false;
        info!(twc_id = %twc_id, "stopping charge at the secondary");
        if changed {
            self.emit(StatusEvent::ChargingChanged {
                twc_id,
                charging: false,
            });
        }

        let rate = self.charge_rate(twc_id, RateCommand::Limit, CentiAmps::ZERO);
        self.transmit(&rate).await?;
        let stop = Command::Stop {
            primary: self.config.primary_id,
            secondary: twc_id,
        };
        self.transmit(&stop).await?;
        Ok(())
    }

    async fn send_heartbeat(&mut self, index: usize) -> Result<(), LinkError> {
        let Some(device) = self.registry.get_mut(index) else {
            return Ok(());
        };
        if !device.allow_charge {
            trace!(twc_id = %device.id, "disabled secondary skipped");
            return Ok(());
        }
        let data = heartbeat_data(device.available_amps, device.protocol_version);
        device.last_amps_offered = device.available_amps;
        let command = Command::Heartbeat {
            primary: self.config.primary_id,
            secondary: device.id,
            data,
        };
        debug!(twc_id = %device.id, amps = %device.available_amps, "heartbeat");
        self.transmit(&command).await
    }

    fn evict(&mut self, index: usize) {
        let Some(device) = self.registry.remove(index) else {
            return;
        };
        info!(twc_id = %device.id, "secondary silent too long; evicted");
        metrics::counter!("twc_devices_evicted_total").increment(1);
        metrics::gauge!("twc_devices").set(self.registry.len() as f64);
        self.pending_charge.remove(&device.id);
        self.emit(StatusEvent::DeviceEvicted { twc_id: device.id });
        self.redistribute();
    }

    /// Split the budget equally, capped by each secondary's wiring limit.
    fn redistribute(&mut self) {
        let Some(share) = equal_share(self.settings.available_amps, self.registry.len()) else {
            return;
        };
        for device in self.registry.iter_mut() {
            let amps = share.min(device.wiring_max_amps);
            device.available_amps = CentiAmps::from_amps(u32::from(amps));
        }
    }

    fn share_for(&self, twc_id: TwcId) -> CentiAmps {
        let share = equal_share(self.settings.available_amps, self.registry.len()).unwrap_or(0);
        let wiring = self
            .registry
            .lookup(twc_id)
            .map_or(0, |device| device.wiring_max_amps);
        CentiAmps::from_amps(u32::from(share.min(wiring)))
    }

    /// Amps left under the wiring total once every other secondary's
    /// allocation is counted.
    fn headroom_for(&self, twc_id: TwcId) -> u16 {
        let others: u32 = self
            .registry
            .all()
            .iter()
            .filter(|device| device.id != twc_id)
            .map(|device| u32::from(device.available_amps.whole_amps()))
            .sum();
        u32::from(self.config.wiring_max_amps_total).saturating_sub(others) as u16
    }

    fn charge_rate(&self, secondary: TwcId, command: RateCommand, amps: CentiAmps) -> Command {
        Command::ChargeRate {
            primary: self.config.primary_id,
            secondary,
            command,
            amps,
        }
    }

    async fn transmit(&mut self, command: &Command) -> Result<(), LinkError> {
        if let Err(err) = self.link.send_command(command).await {
            warn!(command = command.name(), error = %err, "serial write failed");
            return Err(err);
        }
        Ok(())
    }

    /// True once `interval` has passed since the last link-ready or heartbeat.
    fn slot_open(&self, now: Instant, interval: Duration) -> bool {
        self.last_link_tx
            .map_or(true, |last| now.saturating_duration_since(last) >= interval)
    }

    fn persist_settings(&mut self) -> Result<(), ControlError> {
        self.settings_tx.send_replace(self.settings.clone());
        self.store.save(&self.settings)?;
        Ok(())
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply_command(command).await;
        }
    }

    async fn drain_charge_outcomes(&mut self) {
        let mut outcomes = Vec::new();
        if let Some(vehicle) = self.vehicle.as_mut() {
            while let Ok(outcome) = vehicle.outcomes.try_recv() {
                outcomes.push(outcome);
            }
        }
        for outcome in outcomes {
            self.apply_charge_outcome(outcome).await;
        }
    }

    fn publish_snapshot(&self) {
        self.devices_tx.send_replace(self.registry.all().to_vec());
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }
}

fn check_interval(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes.max(1)) * 60)
}
