use std::time::Duration;

use thiserror::Error;

use crate::{config::ReporterConfig, types::DaemonResponse, types::SampleReport};

pub const SOLAR_UNAVAILABLE: i64 = -1;

/// Upper bound of any cycle delay, whatever the daemon or the config asks for.
pub const MAX_CYCLE_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    #[error("sensor {sensor} unreadable: {reason}")]
    SensorUnavailable { sensor: String, reason: String },
    #[error("daemon request failed: {0}")]
    Transport(String),
    #[error("daemon reply is not valid JSON: {0}")]
    MalformedReply(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleReason {
    NightMode,
    Failed(CycleError),
    ServerInterval(DaemonResponse),
    DefaultInterval(DaemonResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NextCycle {
    pub delay: Duration,
    pub reason: CycleReason,
}

impl NextCycle {
    pub fn night(config: &ReporterConfig) -> Self {
        Self {
            delay: Duration::from_secs(config.night_mode.interval_s),
            reason: CycleReason::NightMode,
        }
    }

    pub fn failed(config: &ReporterConfig, error: CycleError) -> Self {
        Self {
            delay: Duration::from_secs(config.pause_on_error_s),
            reason: CycleReason::Failed(error),
        }
    }

    pub fn from_reply(config: &ReporterConfig, body: &str) -> Self {
        match DaemonResponse::parse(body) {
            Ok(response) => match response.suggested_interval() {
                Some(delay) => Self {
                    delay,
                    reason: CycleReason::ServerInterval(response),
                },
                None => Self {
                    delay: Duration::from_secs(config.default_request_interval_s),
                    reason: CycleReason::DefaultInterval(response),
                },
            },
            Err(err) => Self::failed(config, CycleError::MalformedReply(err.to_string())),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.reason, CycleReason::Failed(_))
    }
}

pub fn is_night(config: &ReporterConfig, local_hour: u32) -> bool {
    config.night_mode.window().contains(local_hour)
}

/// Seconds sent as `delay_request`; partial seconds count as a whole one.
pub fn whole_seconds(delay: Duration) -> u64 {
    if delay.subsec_nanos() > 0 {
        delay.as_secs().saturating_add(1)
    } else {
        delay.as_secs()
    }
}

pub fn truncate_watts(watts: f64) -> i64 {
    if watts.is_finite() {
        watts.trunc() as i64
    } else {
        0
    }
}

pub fn normalize_injection(raw_watts: f64, reverse: bool) -> i64 {
    let watts = truncate_watts(raw_watts);
    if reverse {
        watts.saturating_neg()
    } else {
        watts
    }
}

/// A reading of exactly zero counts as unavailable unless `zero_is_unavailable` is off.
pub fn solar_or_unavailable(reading: Option<f64>, zero_is_unavailable: bool) -> i64 {
    match reading {
        Some(watts) if !watts.is_finite() => SOLAR_UNAVAILABLE,
        Some(watts) if watts == 0.0 && zero_is_unavailable => SOLAR_UNAVAILABLE,
        Some(watts) => truncate_watts(watts),
        None => SOLAR_UNAVAILABLE,
    }
}

pub fn build_report(
    config: &ReporterConfig,
    grid_watts: f64,
    solar_watts: Option<f64>,
    previous_delay: Duration,
) -> SampleReport {
    SampleReport {
        injection_power: normalize_injection(grid_watts, config.grid_reverse_measure),
        solar_power: solar_or_unavailable(solar_watts, config.solar_zero_is_unavailable),
        delay_request: config
            .send_delay_request
            .then(|| whole_seconds(previous_delay)),
    }
}
