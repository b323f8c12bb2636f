use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use primary::{VehicleControl, VehicleError};

#[derive(Debug, Serialize)]
struct ChargeCommand<'a> {
    vin: &'a str,
    enable: bool,
}

/// Forwards start/stop requests to a vehicle charge-control service, which
/// owns the account credentials.
///
/// The service takes `POST <url>` with `{"vin": "...", "enable": true}`
/// and answers 2xx on success or 404 for a vehicle it does not know.
pub struct HttpVehicleControl {
    client: reqwest::Client,
    url: String,
}

impl HttpVehicleControl {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl VehicleControl for HttpVehicleControl {
    async fn set_charging(&self, vin: &str, enable: bool) -> Result<(), VehicleError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&ChargeCommand { vin, enable })
            .send()
            .await
            .map_err(|err| VehicleError::Request(err.to_string()))?;

        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(VehicleError::UnknownVehicle(vin.to_string())),
            status => Err(VehicleError::Request(format!("service returned {status}"))),
        }
    }
}
