use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use primary::charging::set_charging_with_retry;
use primary::{
    ChargeError, ChargeRequest, ChargeWorker, ChargeWorkerConfig, VehicleControl, VehicleError,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use types::TwcId;

/// Fails the first `failures` calls, then succeeds.
struct FlakyVehicle {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyVehicle {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VehicleControl for FlakyVehicle {
    async fn set_charging(&self, _vin: &str, _enable: bool) -> Result<(), VehicleError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(VehicleError::Request("vehicle asleep".to_string()))
        } else {
            Ok(())
        }
    }
}

fn request() -> ChargeRequest {
    ChargeRequest {
        twc_id: TwcId::new(0x12, 0x34),
        vin: "5YJ3E1EA1KF123456".to_string(),
        enable: true,
    }
}

#[tokio::test(start_paused = true)]
async fn retries_until_the_vehicle_accepts() {
    let vehicle = FlakyVehicle::new(3);
    let started = Instant::now();

    set_charging_with_retry(&vehicle, &request(), &ChargeWorkerConfig::default())
        .await
        .expect("eventually accepted");

    assert_eq!(vehicle.calls(), 4);
    assert_eq!(started.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let vehicle = FlakyVehicle::new(u32::MAX);

    let err = set_charging_with_retry(&vehicle, &request(), &ChargeWorkerConfig::default())
        .await
        .expect_err("never accepted");

    assert!(matches!(err, ChargeError::RetriesExhausted { attempts: 10, .. }));
    assert_eq!(vehicle.calls(), 10);
}

#[tokio::test(start_paused = true)]
async fn worker_reports_outcomes_back() {
    let vehicle = Arc::new(FlakyVehicle::new(1));
    let (request_tx, request_rx) = mpsc::channel(4);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ChargeWorker::new(
        vehicle.clone(),
        ChargeWorkerConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        },
        request_rx,
        outcome_tx,
        shutdown_rx,
    );
    let task = tokio::spawn(worker.run());

    request_tx.send(request()).await.expect("queue request");
    let outcome = outcome_rx.recv().await.expect("outcome");
    assert_eq!(outcome.request, request());
    assert!(outcome.result.is_ok());
    assert_eq!(vehicle.calls(), 2);

    shutdown_tx.send(true).expect("shutdown");
    task.await.expect("join");
}
