//! Vehicle-side charge start/stop requests.
//!
//! Calls to the vehicle API are slow and retried, so they run on a
//! [`ChargeWorker`] task. The controller hands over a [`ChargeRequest`] and
//! later applies the [`ChargeOutcome`] the worker reports back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use types::TwcId;

#[derive(Debug, Error)]
pub enum VehicleError {
    #[error("vehicle api request failed: {0}")]
    Request(String),
    #[error("no vehicle with vin {0} on this account")]
    UnknownVehicle(String),
}

#[derive(Debug, Error)]
pub enum ChargeError {
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: VehicleError,
    },
}

/// Remote start/stop of a vehicle's charging session by VIN.
#[async_trait]
pub trait VehicleControl: Send + Sync {
    async fn set_charging(&self, vin: &str, enable: bool) -> Result<(), VehicleError>;
}

#[derive(Debug, Clone)]
pub struct ChargeWorkerConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ChargeWorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub twc_id: TwcId,
    pub vin: String,
    pub enable: bool,
}

#[derive(Debug)]
pub struct ChargeOutcome {
    pub request: ChargeRequest,
    pub result: Result<(), ChargeError>,
}

/// Call `control` until it succeeds or `max_attempts` calls have failed,
/// sleeping `retry_delay` between attempts.
pub async fn set_charging_with_retry(
    control: &dyn VehicleControl,
    request: &ChargeRequest,
    config: &ChargeWorkerConfig,
) -> Result<(), ChargeError> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match control.set_charging(&request.vin, request.enable).await {
            Ok(()) => {
                debug!(twc_id = %request.twc_id, attempt, "vehicle accepted charge request");
                return Ok(());
            }
            Err(err) => {
                warn!(
                    twc_id = %request.twc_id,
                    vin = %request.vin,
                    enable = request.enable,
                    attempt,
                    error = %err,
                    "vehicle charge request failed"
                );
                if attempt >= max_attempts {
                    return Err(ChargeError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                sleep(config.retry_delay).await;
            }
        }
    }
}

/// Runs vehicle requests off the controller loop, one task per request.
pub struct ChargeWorker {
    control: Arc<dyn VehicleControl>,
    config: ChargeWorkerConfig,
    requests: mpsc::Receiver<ChargeRequest>,
    outcomes: mpsc::Sender<ChargeOutcome>,
    shutdown: watch::Receiver<bool>,
}

impl ChargeWorker {
    pub fn new(
        control: Arc<dyn VehicleControl>,
        config: ChargeWorkerConfig,
        requests: mpsc::Receiver<ChargeRequest>,
        outcomes: mpsc::Sender<ChargeOutcome>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            control,
            config,
            requests,
            outcomes,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        debug!("charge request channel closed");
                        break;
                    };
                    info!(
                        twc_id = %request.twc_id,
                        vin = %request.vin,
                        enable = request.enable,
                        "dispatching vehicle charge request"
                    );
                    let control = Arc::clone(&self.control);
                    let config = self.config.clone();
                    let outcomes = self.outcomes.clone();
                    in_flight.spawn(async move {
                        let result = set_charging_with_retry(control.as_ref(), &request, &config).await;
                        let _ = outcomes.send(ChargeOutcome { request, result }).await;
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("charge worker shutdown requested");
                        break;
                    }
                }
            }
        }
        in_flight.abort_all();
    }
}
