use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use regulator_common::{
    build_report, is_night, parse_timezone, CycleError, CycleReason, NextCycle, ReporterConfig,
};

use crate::{
    client::{DaemonTransport, HttpDaemonClient},
    meter::{PowerMeter, ShellyRpcMeter},
    scheduler::CycleScheduler,
    settings,
};

pub struct Reporter<M, T> {
    config: ReporterConfig,
    meter: M,
    transport: T,
    scheduler: CycleScheduler,
}

impl<M: PowerMeter, T: DaemonTransport> Reporter<M, T> {
    pub fn new(config: ReporterConfig, meter: M, transport: T) -> Self {
        let scheduler =
            CycleScheduler::new(Duration::from_secs(config.default_request_interval_s));
        Self {
            config,
            meter,
            transport,
            scheduler,
        }
    }

    pub fn config(&self) -> &ReporterConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &CycleScheduler {
        &self.scheduler
    }

    pub fn meter(&self) -> &M {
        &self.meter
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn run_cycle(&self, local_hour: u32) -> NextCycle {
        let next = self.sample_and_report(local_hour).await;
        log_outcome(&next);
        next
    }

    async fn sample_and_report(&self, local_hour: u32) -> NextCycle {
        if is_night(&self.config, local_hour) {
            return NextCycle::night(&self.config);
        }

        let grid_sensor = &self.config.grid_sensor_id;
        let grid_watts = match self.meter.active_power(grid_sensor).await {
            Ok(watts) if watts.is_finite() => watts,
            Ok(watts) => {
                return NextCycle::failed(
                    &self.config,
                    CycleError::SensorUnavailable {
                        sensor: grid_sensor.clone(),
                        reason: format!("non-finite reading {watts}"),
                    },
                );
            }
            Err(err) => {
                return NextCycle::failed(
                    &self.config,
                    CycleError::SensorUnavailable {
                        sensor: grid_sensor.clone(),
                        reason: err.to_string(),
                    },
                );
            }
        };

        let solar_watts = self.read_solar().await;
        let report = build_report(
            &self.config,
            grid_watts,
            solar_watts,
            self.scheduler.delay(),
        );
        debug!(
            injection_power = report.injection_power,
            solar_power = report.solar_power,
            "sending report"
        );

        let reply = match self.transport.post_report(&report).await {
            Ok(reply) => reply,
            Err(err) => {
                return NextCycle::failed(&self.config, CycleError::Transport(err.to_string()));
            }
        };

        if !reply.is_success() {
            warn!(status = reply.status, "daemon answered with an error status");
        }

        NextCycle::from_reply(&self.config, &reply.body)
    }

    async fn read_solar(&self) -> Option<f64> {
        let sensor = self.config.solar_sensor()?;
        match self.meter.active_power(sensor).await {
            Ok(watts) => {
                if watts == 0.0 && self.config.solar_zero_is_unavailable {
                    debug!(sensor, "solar reading of 0 W reported as unavailable");
                }
                Some(watts)
            }
            Err(err) => {
                debug!(sensor, "solar sensor unreadable: {err}");
                None
            }
        }
    }

    /// Cycles forever; `local_hour` is asked once per cycle.
    pub async fn run_with_clock(
        &mut self,
        mut local_hour: impl FnMut() -> u32,
    ) -> anyhow::Result<()> {
        loop {
            let next = self.run_cycle(local_hour()).await;
            self.scheduler.reschedule(next.delay);
            self.scheduler.wait().await;
        }
    }
}

fn log_outcome(next: &NextCycle) {
    match &next.reason {
        CycleReason::NightMode => {
            debug!("night mode, next request in {:?}", next.delay);
        }
        CycleReason::Failed(err) => {
            warn!("{err}; pausing {:?}", next.delay);
        }
        CycleReason::ServerInterval(response) | CycleReason::DefaultInterval(response) => {
            info!(
                return_code = ?response.return_code,
                power_limit = ?response.power_limit_value,
                increment = ?response.power_limit_increment,
                "daemon: {}",
                response.message.as_deref().unwrap_or("-")
            );
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let (runtime, load_error) = settings::resolve_runtime_config().await;
    settings::init_tracing(runtime.reporter.debug);
    if let Some(err) = load_error {
        warn!("{err:#}; using defaults");
    }

    let config = runtime.reporter;
    let timeout = Duration::from_secs(config.request_timeout_s);
    let meter = ShellyRpcMeter::new(&config.meter_url, timeout)?;
    let transport = HttpDaemonClient::new(config.daemon_url.clone(), timeout)?;
    let timezone = parse_timezone(&config.timezone).unwrap_or_else(|err| {
        warn!("{err}; using local time");
        None
    });

    info!(
        daemon = transport.url(),
        meter = %config.meter_url,
        "reporter started"
    );

    let mut reporter = Reporter::new(config, meter, transport);
    tokio::select! {
        result = reporter.run_with_clock(|| settings::local_hour(timezone)) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("reporter stopped");
            Ok(())
        }
    }
}
