use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use site_meter::{
    MeterAggregates, MeterConfig, MeterError, MeterPoller, PowerwallMeter, SiteMeter, SiteReading,
};
use tokio::sync::watch;

#[test]
fn aggregates_document_yields_load_and_solar() {
    let json = r#"{
        "site": {"instant_power": -1200.5, "last_communication_time": "2024-01-01T00:00:00Z"},
        "battery": {"instant_power": 0},
        "load": {"instant_power": -850.0},
        "solar": {"instant_power": 3100.25}
    }"#;
    let aggregates: MeterAggregates = serde_json::from_str(json).expect("parse aggregates");

    assert_eq!(
        aggregates.reading(),
        SiteReading {
            load_watts: 850.0,
            solar_watts: 3100.25,
        }
    );
}

#[test]
fn missing_meters_read_as_zero() {
    let aggregates: MeterAggregates =
        serde_json::from_str(r#"{"site": {"instant_power": 10}}"#).expect("parse aggregates");
    assert_eq!(aggregates.reading(), SiteReading::default());
}

#[test]
fn meter_url_must_be_http() {
    let config = MeterConfig {
        url: "192.168.1.20".to_string(),
        ..MeterConfig::default()
    };
    assert!(matches!(
        PowerwallMeter::new(&config),
        Err(MeterError::InvalidUrl(_))
    ));

    let config = MeterConfig {
        url: "http://192.168.1.20/".to_string(),
        ..MeterConfig::default()
    };
    let meter = PowerwallMeter::new(&config).expect("meter");
    assert_eq!(
        meter.aggregates_url(),
        "http://192.168.1.20/api/meters/aggregates"
    );
}

/// Succeeds on odd calls, fails on even ones.
struct AlternatingMeter {
    calls: AtomicU32,
}

#[async_trait]
impl SiteMeter for AlternatingMeter {
    async fn read(&self) -> Result<SiteReading, MeterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % 2 == 1 {
            Ok(SiteReading {
                load_watts: 500.0,
                solar_watts: f64::from(call) * 1000.0,
            })
        } else {
            Err(MeterError::Status(reqwest::StatusCode::BAD_GATEWAY))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn poller_publishes_latest_and_clears_on_failure() {
    let meter = Arc::new(AlternatingMeter {
        calls: AtomicU32::new(0),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (poller, mut readings) = MeterPoller::new(meter, Duration::from_secs(10), shutdown_rx);
    let task = tokio::spawn(poller.run());

    readings.changed().await.expect("first reading");
    assert_eq!(
        *readings.borrow(),
        Some(SiteReading {
            load_watts: 500.0,
            solar_watts: 1000.0,
        })
    );

    readings.changed().await.expect("second reading");
    assert_eq!(*readings.borrow(), None);

    shutdown_tx.send(true).expect("shutdown");
    task.await.expect("join");
}
