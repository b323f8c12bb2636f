use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
#[cfg(target_os = "linux")]
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use primary::{ChargeWorker, ControllerHandle, PrimaryController};
use serial_link::{open_serial, FramedLink};
use site_meter::{MeterPoller, PowerwallMeter};
use twc_manager::{HttpVehicleControl, ManagerConfig, TomlSettingsStore};
use types::StatusEvent;

const CHARGE_QUEUE: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = parse_config_arg();
    let config = ManagerConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    install_metrics(config.metrics_listen.as_deref())?;

    let store = TomlSettingsStore::new(&config.settings_path);
    let settings = match store.load().context("load saved settings failed")? {
        Some(saved) => {
            info!(path = %store.path().display(), "restored saved power settings");
            saved
        }
        None => config.power.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let port = open_serial(&config.serial).context("open serial port failed")?;
    let link = FramedLink::new(port, &config.serial);
    let (mut controller, handle) = PrimaryController::new(
        link,
        config.controller_config()?,
        settings,
        Box::new(store),
    )
    .context("controller init failed")?;

    let mut background: Vec<JoinHandle<()>> = Vec::new();

    if let Some(ref meter_config) = config.meter {
        let meter = PowerwallMeter::new(meter_config).context("site meter init failed")?;
        let (poller, readings) = MeterPoller::new(
            Arc::new(meter),
            Duration::from_millis(meter_config.poll_interval_ms),
            shutdown_rx.clone(),
        );
        controller = controller.with_site_meter(readings);
        background.push(tokio::spawn(poller.run()));
    }

    if let Some(ref vehicle) = config.vehicle {
        let control = HttpVehicleControl::new(&vehicle.url, Duration::from_millis(vehicle.timeout_ms))
            .context("vehicle client init failed")?;
        let (request_tx, request_rx) = mpsc::channel(CHARGE_QUEUE);
        let (outcome_tx, outcome_rx) = mpsc::channel(CHARGE_QUEUE);
        let worker = ChargeWorker::new(
            Arc::new(control),
            config.charging.clone(),
            request_rx,
            outcome_tx,
            shutdown_rx.clone(),
        );
        controller = controller.with_vehicle_control(request_tx, outcome_rx);
        background.push(tokio::spawn(worker.run()));
    } else {
        info!("no vehicle service configured, start/stop goes to the chargers");
    }

    background.push(tokio::spawn(log_events(handle.clone(), shutdown_rx.clone())));
    let mut controller_task = tokio::spawn(controller.run(shutdown_rx.clone()));

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            controller_task.await
        }
        result = &mut controller_task => {
            let _ = shutdown_tx.send(true);
            result
        }
    };

    for task in background {
        if let Err(err) = task.await {
            warn!(error = %err, "background task join failed");
        }
    }
    if let Some(task) = watchdog_handle {
        let _ = task.await;
    }
    drop(handle);

    outcome
        .context("controller task failed")?
        .context("primary controller stopped with error")
}

/// Logs controller status events as JSON until shutdown.
async fn log_events(handle: ControllerHandle, mut shutdown: watch::Receiver<bool>) {
    let mut events = handle.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn log_event(event: &StatusEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(event = %json, "status event"),
        Err(err) => warn!(error = %err, "status event encode failed"),
    }
}

fn install_metrics(listen: Option<&str>) -> Result<()> {
    let Some(listen) = listen else {
        return Ok(());
    };
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid metrics listen address {listen}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("metrics exporter install failed")?;
    info!(%addr, "prometheus exporter listening");
    Ok(())
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
