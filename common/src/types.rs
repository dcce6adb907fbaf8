use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cycle::MAX_CYCLE_DELAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleReport {
    pub injection_power: i64,
    pub solar_power: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_request: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DaemonResponse {
    pub return_code: Option<i64>,
    pub message: Option<String>,
    pub power_limit_value: Option<f64>,
    pub power_limit_increment: Option<f64>,
    pub sensor_read_interval: Option<f64>,
}

impl DaemonResponse {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(body)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        Self {
            return_code: value.get("return_code").and_then(Value::as_i64),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            power_limit_value: value.get("power_limit_value").and_then(Value::as_f64),
            power_limit_increment: value.get("power_limit_increment").and_then(Value::as_f64),
            sensor_read_interval: value.get("sensor_read_interval").and_then(Value::as_f64),
        }
    }

    /// Positive `sensor_read_interval` in seconds, capped at [`MAX_CYCLE_DELAY`].
    pub fn suggested_interval(&self) -> Option<Duration> {
        self.sensor_read_interval
            .filter(|interval| interval.is_finite() && *interval > 0.0)
            .map(|interval| Duration::from_secs_f64(interval.min(MAX_CYCLE_DELAY.as_secs_f64())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegulateReply {
    pub return_code: u8,
    pub message: String,
    pub power_limit_value: i32,
    pub power_limit_increment: i32,
    pub sensor_read_interval: i32,
}

impl RegulateReply {
    pub fn new(code: ReturnCode, limit: i32, increment: i32, interval: i32) -> Self {
        Self {
            return_code: code.code(),
            message: code.message().to_string(),
            power_limit_value: limit,
            power_limit_increment: increment,
            sensor_read_interval: interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCode {
    Ok,
    DifferentPowerLimit,
    ModbusFailure,
    ModbusRecurrentFailure,
    OtherError,
}

impl ReturnCode {
    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::DifferentPowerLimit => 1,
            Self::ModbusFailure => 2,
            Self::ModbusRecurrentFailure => 3,
            Self::OtherError => 9,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::DifferentPowerLimit => {
                "Power-limit value read on device is different from stored value"
            }
            Self::ModbusFailure => "Modbus communication failed",
            Self::ModbusRecurrentFailure => "Modbus recurrent communication failure",
            Self::OtherError => "An other error occurred",
        }
    }

    pub fn allows_regulation(self) -> bool {
        matches!(self, Self::Ok | Self::DifferentPowerLimit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSample {
    pub solar: i64,
    pub injection: i64,
    pub power_limit: i32,
}

impl MqttSample {
    pub fn new(injection: i64, solar: i64) -> Self {
        Self {
            solar,
            injection,
            power_limit: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    pub solar: i64,
    pub injection: i64,
    pub power_limit: f64,
    pub delay: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub code: u8,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn report_omits_delay_when_absent() {
        let report = SampleReport {
            injection_power: 120,
            solar_power: -1,
            delay_request: None,
        };
        let body = serde_json::to_string(&report).unwrap();
        assert_eq!(body, r#"{"injection_power":120,"solar_power":-1}"#);

        let with_delay = SampleReport {
            delay_request: Some(5),
            ..report
        };
        let body = serde_json::to_string(&with_delay).unwrap();
        assert_eq!(
            body,
            r#"{"injection_power":120,"solar_power":-1,"delay_request":5}"#
        );
    }

    #[test]
    fn daemon_reply_is_readable_by_reporter() {
        let reply = RegulateReply::new(ReturnCode::DifferentPowerLimit, 950, -50, 5);
        let body = serde_json::to_string(&reply).unwrap();
        let parsed = DaemonResponse::parse(&body).unwrap();

        assert_eq!(parsed.return_code, Some(1));
        assert_eq!(parsed.power_limit_value, Some(950.0));
        assert_eq!(parsed.power_limit_increment, Some(-50.0));
        assert_eq!(parsed.suggested_interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn suggested_interval_ignores_non_positive_and_missing_values() {
        let zero = DaemonResponse::parse(r#"{"sensor_read_interval": 0}"#).unwrap();
        let negative = DaemonResponse::parse(r#"{"sensor_read_interval": -1}"#).unwrap();
        let missing = DaemonResponse::parse(r#"{"return_code": 0}"#).unwrap();
        let not_object = DaemonResponse::parse("42").unwrap();

        assert_eq!(zero.suggested_interval(), None);
        assert_eq!(negative.suggested_interval(), None);
        assert_eq!(missing.suggested_interval(), None);
        assert_eq!(not_object.suggested_interval(), None);
    }

    #[test]
    fn fractional_interval_is_kept() {
        let parsed = DaemonResponse::parse(r#"{"sensor_read_interval": 2.5}"#).unwrap();
        assert_eq!(parsed.suggested_interval(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn oversized_interval_is_capped() {
        let huge = DaemonResponse::parse(r#"{"sensor_read_interval": 1e20}"#).unwrap();
        let largest =
            DaemonResponse::from_value(&serde_json::json!({"sensor_read_interval": f64::MAX}));

        assert_eq!(huge.suggested_interval(), Some(MAX_CYCLE_DELAY));
        assert_eq!(largest.suggested_interval(), Some(MAX_CYCLE_DELAY));
    }

    #[test]
    fn unparseable_body_is_an_error() {
        assert!(DaemonResponse::parse("<html>busy</html>").is_err());
        assert!(DaemonResponse::parse("").is_err());
    }

    #[test]
    fn mqtt_sample_carries_placeholder_limit() {
        let sample = MqttSample::new(-250, 1800);
        let body = serde_json::to_string(&sample).unwrap();
        assert_eq!(body, r#"{"solar":1800,"injection":-250,"power_limit":-1}"#);
    }
}
