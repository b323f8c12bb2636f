//! Site load and solar readings for the charging budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub use types::SiteReading;

const AGGREGATES_PATH: &str = "/api/meters/aggregates";

#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Base url of the gateway, e.g. `http://192.168.1.20`.
    pub url: String,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            poll_interval_ms: 10_000,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("meter url must start with http:// or https://, got {0:?}")]
    InvalidUrl(String),
    #[error("meter request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("meter returned status {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait SiteMeter: Send + Sync {
    async fn read(&self) -> Result<SiteReading, MeterError>;
}

/// One meter in the aggregates document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterValue {
    #[serde(default)]
    pub instant_power: f64,
}

/// The gateway's `/api/meters/aggregates` document. Only the fields the
/// budget needs are decoded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeterAggregates {
    pub site: Option<MeterValue>,
    pub battery: Option<MeterValue>,
    pub load: Option<MeterValue>,
    pub solar: Option<MeterValue>,
}

impl MeterAggregates {
    /// Missing meters read as zero. Load is reported negative by some
    /// gateways, so only its magnitude is used.
    pub fn reading(&self) -> SiteReading {
        let power = |meter: &Option<MeterValue>| {
            meter.as_ref().map_or(0.0, |meter| meter.instant_power)
        };
        SiteReading {
            load_watts: power(&self.load).abs(),
            solar_watts: power(&self.solar).max(0.0),
        }
    }
}

/// Reads the aggregates endpoint of a Powerwall-style gateway.
pub struct PowerwallMeter {
    client: reqwest::Client,
    aggregates_url: String,
}

impl PowerwallMeter {
    pub fn new(config: &MeterConfig) -> Result<Self, MeterError> {
        let base = config.url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(MeterError::InvalidUrl(config.url.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()?;

        Ok(Self {
            client,
            aggregates_url: format!("{base}{AGGREGATES_PATH}"),
        })
    }

    pub fn aggregates_url(&self) -> &str {
        &self.aggregates_url
    }
}

#[async_trait]
impl SiteMeter for PowerwallMeter {
    async fn read(&self) -> Result<SiteReading, MeterError> {
        let resp = self.client.get(&self.aggregates_url).send().await?;
        if !resp.status().is_success() {
            return Err(MeterError::Status(resp.status()));
        }
        let aggregates: MeterAggregates = resp.json().await?;
        Ok(aggregates.reading())
    }
}

/// Polls a [`SiteMeter`] and publishes the latest reading.
///
/// A failed read publishes `None` so a stale value never outlives an outage.
pub struct MeterPoller {
    meter: Arc<dyn SiteMeter>,
    interval: Duration,
    readings: watch::Sender<Option<SiteReading>>,
    shutdown: watch::Receiver<bool>,
}

impl MeterPoller {
    pub fn new(
        meter: Arc<dyn SiteMeter>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, watch::Receiver<Option<SiteReading>>) {
        let (readings, rx) = watch::channel(None);
        let poller = Self {
            meter,
            interval,
            readings,
            shutdown,
        };
        (poller, rx)
    }

    pub async fn run(mut self) {
        info!(interval_ms = self.interval.as_millis() as u64, "meter poller started");
        loop {
            match self.meter.read().await {
                Ok(reading) => {
                    debug!(
                        load_watts = reading.load_watts,
                        solar_watts = reading.solar_watts,
                        "site meter reading"
                    );
                    self.readings.send_replace(Some(reading));
                }
                Err(err) => {
                    warn!(error = %err, "site meter read failed");
                    metrics::counter!("twc_meter_errors_total").increment(1);
                    self.readings.send_replace(None);
                }
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("meter poller shutdown requested");
                        break;
                    }
                }
            }
        }
    }
}
