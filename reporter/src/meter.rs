use std::{future::Future, time::Duration};

use anyhow::Context;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("component {0} missing from device status")]
    MissingComponent(String),
    #[error("component {0} has no numeric act_power")]
    MissingPower(String),
    #[error("meter request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Instantaneous active power of a metering component, by sensor id (`em1:0`).
pub trait PowerMeter {
    fn active_power(
        &self,
        sensor_id: &str,
    ) -> impl Future<Output = Result<f64, MeterError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ShellyRpcMeter {
    client: Client,
    status_url: String,
}

impl ShellyRpcMeter {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build meter http client")?;

        Ok(Self {
            client,
            status_url: format!("{}/rpc/Shelly.GetStatus", base_url.trim_end_matches('/')),
        })
    }

    async fn device_status(&self) -> Result<Value, MeterError> {
        let status = self
            .client
            .get(&self.status_url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        Ok(status)
    }
}

impl PowerMeter for ShellyRpcMeter {
    async fn active_power(&self, sensor_id: &str) -> Result<f64, MeterError> {
        let status = self.device_status().await?;
        act_power(&status, sensor_id)
    }
}

pub fn act_power(status: &Value, sensor_id: &str) -> Result<f64, MeterError> {
    let component = status
        .get(sensor_id)
        .filter(|component| component.is_object())
        .ok_or_else(|| MeterError::MissingComponent(sensor_id.to_string()))?;

    component
        .get("act_power")
        .and_then(Value::as_f64)
        .ok_or_else(|| MeterError::MissingPower(sensor_id.to_string()))
}

#[cfg(test)]
mod tests {
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn reads_act_power_of_component() {
        let status = json!({
            "em1:0": {"id": 0, "current": 2.1, "voltage": 231.4, "act_power": -412.6},
            "em1:1": {"id": 1, "act_power": 0},
        });

        assert_eq!(act_power(&status, "em1:0").unwrap(), -412.6);
        assert_eq!(act_power(&status, "em1:1").unwrap(), 0.0);
    }

    #[test]
    fn missing_component_or_field_is_an_error() {
        let status = json!({
            "em1:0": {"id": 0, "voltage": 231.4},
            "sys": "up",
        });

        assert!(matches!(
            act_power(&status, "em1:1"),
            Err(MeterError::MissingComponent(_))
        ));
        assert!(matches!(
            act_power(&status, "sys"),
            Err(MeterError::MissingComponent(_))
        ));
        assert!(matches!(
            act_power(&status, "em1:0"),
            Err(MeterError::MissingPower(_))
        ));
    }

    #[tokio::test]
    async fn fetches_status_over_rpc() {
        let app = Router::new().route(
            "/rpc/Shelly.GetStatus",
            get(|| async { Json(json!({"em1:0": {"act_power": 1520.25}})) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let meter =
            ShellyRpcMeter::new(&format!("http://{addr}/"), Duration::from_secs(2)).unwrap();

        assert_eq!(meter.active_power("em1:0").await.unwrap(), 1520.25);
        assert!(matches!(
            meter.active_power("em1:1").await,
            Err(MeterError::MissingComponent(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_meter_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let meter =
            ShellyRpcMeter::new(&format!("http://{addr}"), Duration::from_secs(1)).unwrap();

        assert!(matches!(
            meter.active_power("em1:0").await,
            Err(MeterError::Transport(_))
        ));
    }
}
