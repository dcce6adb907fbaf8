use std::{sync::OnceLock, time::Instant};

use chrono::{Local, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use regulator_common::{
    regulation::percent, DaemonConfig, RegulateReply, RegulationEngine, RegulationWindows,
    RegulatorEvent, ReturnCode, RunPayload, SampleReport,
};

use crate::{
    events::{EventSink, Notifier},
    modbus::{DeviceError, PowerLimitDevice},
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusView {
    /// Per-mille, -1 while unknown.
    pub power_limit: i32,
    pub power_limit_percent: Option<f64>,
    pub device_errors: u32,
    pub watchdog_triggered: bool,
    pub in_regulation_window: bool,
    pub seconds_since_report: u64,
}

/// Serialises every device transaction and state change behind one lock.
pub struct Regulator<D, S> {
    engine: Mutex<RegulationEngine>,
    device: D,
    notifier: Notifier<S>,
    windows: RegulationWindows,
    timezone: Option<Tz>,
    periodic_task_interval_s: u64,
    periodic_read_interval_ms: u64,
    watchdog_timeout_ms: u64,
}

impl<D, S> Regulator<D, S>
where
    D: PowerLimitDevice + Sync,
    S: EventSink + Sync,
{
    pub fn new(
        config: &DaemonConfig,
        windows: RegulationWindows,
        timezone: Option<Tz>,
        device: D,
        notifier: Notifier<S>,
        now_ms: u64,
        now: NaiveTime,
    ) -> Self {
        let engine =
            RegulationEngine::new(config.regulation.clone(), now_ms, windows.contains(now));
        Self {
            engine: Mutex::new(engine),
            device,
            notifier,
            windows,
            timezone,
            periodic_task_interval_s: config.periodic_task_interval_s,
            periodic_read_interval_ms: config.periodic_read_interval_s.saturating_mul(1000),
            watchdog_timeout_ms: config.watchdog_timeout_s.saturating_mul(1000),
        }
    }

    #[cfg(test)]
    pub fn notifier(&self) -> &Notifier<S> {
        &self.notifier
    }

    #[cfg(test)]
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn local_time(&self) -> NaiveTime {
        local_time(self.timezone)
    }

    pub fn in_window(&self, now: NaiveTime) -> bool {
        self.windows.contains(now)
    }

    pub async fn regulate(
        &self,
        report: SampleReport,
        now_ms: u64,
        now: NaiveTime,
    ) -> RegulateReply {
        let mut engine = self.engine.lock().await;
        if engine.note_report(now_ms) {
            warn!("reporter is back after watchdog timeout");
        }

        let mut code = ReturnCode::Ok;
        if engine.current_limit().is_none() {
            code = self.refresh_limit(&mut engine, now_ms).await;
        }

        if !self.in_window(now) {
            return RegulateReply::new(
                ReturnCode::Ok,
                engine.current_limit_or_unknown(),
                0,
                i32::try_from(self.periodic_task_interval_s).unwrap_or(i32::MAX),
            );
        }

        if !code.allows_regulation() {
            return RegulateReply::new(code, -1, 0, -1);
        }

        let injection = report.injection_power;
        let solar = report.solar_power;
        let last = engine.current_limit_or_unknown();
        let decision = engine.calculate(injection, solar);
        if let Some(event) = &decision.event {
            info!("{}", event.message());
            self.notifier.event(event);
        }

        let delay = if decision.next_interval == -1 {
            "default".to_string()
        } else {
            format!("{}s", decision.next_interval)
        };
        let Some(new_limit) = decision.new_limit else {
            debug!(solar, injection, band = %decision.band, "limit unknown, delay={delay}");
            return RegulateReply::new(code, -1, 0, decision.next_interval);
        };
        if decision.increment != 0 {
            debug!(
                solar,
                injection,
                band = %decision.band,
                "increment={}%, limit {}% -> {}%, delay={delay}",
                percent(decision.increment),
                percent(last),
                percent(new_limit)
            );
        } else {
            debug!(
                solar,
                injection,
                band = %decision.band,
                "no change, limit {}%, delay={delay}",
                percent(new_limit)
            );
        }

        if self.notifier.publishes_runs() {
            let payload = RunPayload {
                solar,
                injection,
                power_limit: f64::from(new_limit) / 10.0,
                delay: decision.next_interval,
            };
            if engine.take_run_payload(payload) {
                self.notifier.run(&payload);
            }
        }

        if engine.current_limit() != Some(new_limit)
            && self.write_limit(&mut engine, new_limit).await.is_err()
        {
            return RegulateReply::new(
                ReturnCode::ModbusFailure,
                engine.current_limit_or_unknown(),
                0,
                -1,
            );
        }

        RegulateReply::new(
            code,
            engine.current_limit_or_unknown(),
            decision.increment,
            decision.next_interval,
        )
    }

    pub async fn periodic_tick(&self, now_ms: u64, now: NaiveTime) {
        let in_window = self.in_window(now);
        let mut engine = self.engine.lock().await;

        if let Some(event) = engine.window_transition(in_window) {
            let max = engine.config.max_power_limit;
            info!(
                "regulation window {}, limit to {}%",
                if in_window { "entered" } else { "left" },
                percent(max)
            );
            self.notifier.event(&event);
            if let Err(err) = self.write_limit(&mut engine, max).await {
                warn!("failed to release power limit: {err}");
            }
        }

        if engine.periodic_read_due(in_window, now_ms, self.periodic_read_interval_ms) {
            info!("periodic power limit read");
            self.refresh_limit(&mut engine, now_ms).await;
        }
    }

    /// Releases the limit once when the reporter has gone silent.
    pub async fn watchdog_tick(&self, now_ms: u64) {
        let mut engine = self.engine.lock().await;
        if !engine.watchdog_due(now_ms, self.watchdog_timeout_ms) {
            return;
        }

        let max = engine.config.max_power_limit;
        warn!(
            "watchdog: no report for {}s, limit to {}%",
            self.watchdog_timeout_ms / 1000,
            percent(max)
        );
        if let Err(err) = self.write_limit(&mut engine, max).await {
            warn!("watchdog write failed: {err}");
        }
        engine.mark_watchdog_triggered();
    }

    pub async fn status(&self, now_ms: u64, now: NaiveTime) -> StatusView {
        let engine = self.engine.lock().await;
        StatusView {
            power_limit: engine.current_limit_or_unknown(),
            power_limit_percent: engine.current_limit().map(|limit| f64::from(limit) / 10.0),
            device_errors: engine.device_error_count(),
            watchdog_triggered: engine.is_watchdog_triggered(),
            in_regulation_window: self.in_window(now),
            seconds_since_report: now_ms.saturating_sub(engine.last_report_ms()) / 1000,
        }
    }

    async fn refresh_limit(&self, engine: &mut RegulationEngine, now_ms: u64) -> ReturnCode {
        let raw = match self.device.read_power_limit().await {
            Ok(raw) => raw,
            Err(err) => {
                let (code, events) = engine.record_read_failed();
                warn!(
                    errors = engine.device_error_count(),
                    "power limit read failed: {err}"
                );
                self.notifier.events(events);
                return code;
            }
        };
        self.notifier.events(engine.record_read_ok(now_ms));

        let mut value = i32::from(raw);
        if engine.is_buggy_read(value) {
            let forced = engine.config.max_power_limit;
            warn!(
                "read {}% limit, forcing {}%",
                percent(value),
                percent(forced)
            );
            self.notifier.event(&RegulatorEvent::BuggyLimitCorrected {
                read: value,
                forced,
            });
            if let Err(err) = self.write_limit(engine, forced).await {
                warn!("forced write failed: {err}");
            }
            value = forced;
        }

        let (code, event) = engine.accept_read_limit(value);
        if let Some(event) = event {
            warn!("{}", event.message());
            self.notifier.event(&event);
        }
        code
    }

    async fn write_limit(
        &self,
        engine: &mut RegulationEngine,
        limit: i32,
    ) -> Result<i32, DeviceError> {
        let value = engine.write_value(limit);
        let result = match u16::try_from(value) {
            Ok(register) => self.device.write_power_limit(register).await,
            Err(_) => Err(DeviceError::OutOfRange(value)),
        };

        match result {
            Ok(()) => {
                self.notifier.events(engine.record_write_ok(value));
                Ok(value)
            }
            Err(err) => {
                warn!("power limit write of {}% failed: {err}", percent(value));
                self.notifier.events(engine.record_write_failed());
                Err(err)
            }
        }
    }
}

pub fn local_time(timezone: Option<Tz>) -> NaiveTime {
    match timezone {
        Some(tz) => Utc::now().with_timezone(&tz).time(),
        None => Local::now().time(),
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}


#[cfg(test)]
mod tests {
    use regulator_common::MqttMode;
    use serde_json::json;

    use super::{testing::FakeDevice, *};
    use crate::events::testing::RecordingSink;

    type TestRegulator = Regulator<FakeDevice, RecordingSink>;

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn noon() -> NaiveTime {
        time(12, 0)
    }

    fn regulator(device: FakeDevice) -> TestRegulator {
        regulator_with(DaemonConfig::default(), device)
    }

    fn regulator_with(config: DaemonConfig, device: FakeDevice) -> TestRegulator {
        let windows = RegulationWindows::parse(&config.regulation_windows).unwrap();
        let notifier = Notifier::new(
            RecordingSink::default(),
            config.mqtt_mode,
            &config.mqtt_root_topic,
        );
        Regulator::new(&config, windows, None, device, notifier, 0, noon())
    }

    fn report(injection_power: i64, solar_power: i64) -> SampleReport {
        SampleReport {
            injection_power,
            solar_power,
            delay_request: Some(5),
        }
    }

    fn events(regulator: &TestRegulator) -> Vec<u64> {
        regulator.notifier().sink().event_codes()
    }

    #[tokio::test]
    async fn first_report_reads_device_then_steps_limit() {
        let regulator = regulator(FakeDevice::holding(800));

        let reply = regulator.regulate(report(250, 1500), 1_000, noon()).await;

        assert_eq!(regulator.device().reads(), 1);
        assert_eq!(reply.return_code, 0);
        assert_eq!(reply.message, "OK");
        assert!(reply.power_limit_increment < 0);
        assert_eq!(
            reply.power_limit_value,
            800 + reply.power_limit_increment
        );
        assert_eq!(
            regulator.device().writes(),
            vec![u16::try_from(reply.power_limit_value).unwrap()]
        );

        let runs = regulator
            .notifier()
            .sink()
            .on("solar_power_regulator/run");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["solar"], json!(1500));
        assert_eq!(runs[0]["injection"], json!(250));
    }

    #[tokio::test]
    async fn known_limit_is_not_read_again() {
        let regulator = regulator(FakeDevice::holding(800));

        regulator.regulate(report(250, 1500), 1_000, noon()).await;
        regulator.regulate(report(250, 1500), 2_000, noon()).await;

        assert_eq!(regulator.device().reads(), 1);
    }

    #[tokio::test]
    async fn unchanged_limit_is_not_written() {
        let regulator = regulator(FakeDevice::holding(1000));

        // Importing while already at max keeps the limit pinned.
        let reply = regulator.regulate(report(-50, 900), 1_000, noon()).await;

        assert_eq!(reply.power_limit_value, 1000);
        assert!(regulator.device().writes().is_empty());
    }

    #[tokio::test]
    async fn outside_window_reports_periodic_interval() {
        let regulator = regulator(FakeDevice::holding(650));

        let reply = regulator.regulate(report(400, 1200), 1_000, time(23, 30)).await;

        assert_eq!(reply.return_code, 0);
        assert_eq!(reply.power_limit_value, 650);
        assert_eq!(reply.power_limit_increment, 0);
        assert_eq!(reply.sensor_read_interval, 60);
        assert!(regulator.device().writes().is_empty());
    }

    #[tokio::test]
    async fn device_failure_is_reported_with_unknown_limit() {
        let regulator = regulator(FakeDevice::offline());

        let reply = regulator.regulate(report(400, 1200), 1_000, noon()).await;

        assert_eq!(reply.return_code, 2);
        assert_eq!(reply.power_limit_value, -1);
        assert_eq!(reply.power_limit_increment, 0);
        assert_eq!(reply.sensor_read_interval, -1);
        assert_eq!(events(&regulator), vec![3]);
    }

    #[tokio::test]
    async fn recurrent_failures_escalate_then_recover() {
        let regulator = regulator(FakeDevice::offline());

        let mut codes = Vec::new();
        for i in 0..5 {
            let reply = regulator.regulate(report(0, 500), i * 1_000, noon()).await;
            codes.push(reply.return_code);
        }
        assert_eq!(codes, vec![2, 2, 2, 2, 3]);

        regulator.device().set(Some(700));
        let reply = regulator.regulate(report(0, 500), 10_000, noon()).await;

        assert_eq!(reply.return_code, 0);
        assert_eq!(reply.power_limit_value, 700);
        assert_eq!(events(&regulator), vec![3, 4]);
        let status = regulator.status(10_000, noon()).await;
        assert_eq!(status.device_errors, 0);
    }

    #[tokio::test]
    async fn buggy_read_is_forced_to_max() {
        let regulator = regulator(FakeDevice::holding(300));

        let reply = regulator.regulate(report(0, 500), 1_000, noon()).await;

        assert_eq!(regulator.device().writes(), vec![1000]);
        assert_eq!(reply.power_limit_value, 1000);
        assert_eq!(events(&regulator), vec![5]);
        assert_eq!(
            regulator.notifier().sink().on("solar_power_regulator/evt")[0]["msg"],
            json!("POWER_LIMIT_30.0. Forced to 100.0%")
        );
    }

    #[tokio::test]
    async fn periodic_read_flags_divergence() {
        let mut config = DaemonConfig::default();
        config.periodic_read_interval_s = 900;
        let regulator = regulator_with(config, FakeDevice::holding(1000));

        // First tick reads the device.
        regulator.periodic_tick(0, noon()).await;
        assert_eq!(regulator.device().reads(), 1);

        regulator.device().set(Some(420));
        regulator.periodic_tick(60_000, noon()).await;
        assert_eq!(regulator.device().reads(), 1);

        regulator.periodic_tick(901_000, noon()).await;
        assert_eq!(regulator.device().reads(), 2);
        assert_eq!(events(&regulator), vec![6]);

        let status = regulator.status(901_000, noon()).await;
        assert_eq!(status.power_limit, 420);
        assert_eq!(status.power_limit_percent, Some(42.0));
    }

    #[tokio::test]
    async fn divergent_read_still_regulates() {
        let regulator = regulator(FakeDevice::holding(1000));
        regulator.periodic_tick(0, noon()).await;
        regulator.device().set(Some(500));
        regulator.periodic_tick(1_000_000, noon()).await;

        let reply = regulator.regulate(report(0, 900), 1_001_000, noon()).await;
        assert_eq!(reply.return_code, 0);
        assert_eq!(reply.power_limit_value, 500 + reply.power_limit_increment);
    }

    #[tokio::test]
    async fn window_exit_releases_limit() {
        let regulator = regulator(FakeDevice::holding(400));
        regulator.regulate(report(0, 500), 0, noon()).await;

        regulator.periodic_tick(60_000, time(22, 30)).await;

        assert_eq!(regulator.device().writes().last(), Some(&1000));
        assert_eq!(events(&regulator), vec![2]);
        assert!(!regulator.status(60_000, time(22, 30)).await.in_regulation_window);

        // Out of window: no periodic reads.
        let reads = regulator.device().reads();
        regulator.periodic_tick(2_000_000, time(23, 0)).await;
        assert_eq!(regulator.device().reads(), reads);

        regulator.periodic_tick(3_000_000, time(6, 0)).await;
        assert_eq!(events(&regulator), vec![2, 1]);
    }

    #[tokio::test]
    async fn watchdog_releases_once_until_next_report() {
        let regulator = regulator(FakeDevice::holding(400));
        regulator.regulate(report(0, 500), 0, noon()).await;
        let writes_before = regulator.device().writes().len();

        regulator.watchdog_tick(3_000_000).await;
        assert_eq!(regulator.device().writes().len(), writes_before);

        regulator.watchdog_tick(3_601_000).await;
        regulator.watchdog_tick(3_700_000).await;
        assert_eq!(regulator.device().writes().len(), writes_before + 1);
        assert_eq!(regulator.device().value(), Some(1000));
        assert!(regulator.status(3_700_000, noon()).await.watchdog_triggered);

        regulator.regulate(report(0, 500), 3_800_000, noon()).await;
        assert!(!regulator.status(3_800_000, noon()).await.watchdog_triggered);
    }

    #[tokio::test]
    async fn failed_write_reports_modbus_failure() {
        let regulator = regulator(FakeDevice::holding(800));
        regulator.device().fail_writes(true);

        let reply = regulator.regulate(report(250, 1500), 1_000, noon()).await;

        assert_eq!(reply.return_code, 2);
        assert_eq!(reply.power_limit_value, 800);
        assert_eq!(reply.sensor_read_interval, -1);
        assert_eq!(events(&regulator), vec![3]);
    }

    #[tokio::test]
    async fn repeated_run_summaries_are_published_once() {
        let regulator = regulator(FakeDevice::holding(1000));

        for now_ms in [1_000, 2_000, 3_000] {
            regulator.regulate(report(-50, 900), now_ms, noon()).await;
        }

        let runs = regulator
            .notifier()
            .sink()
            .on("solar_power_regulator/run");
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn mqtt_disabled_publishes_nothing() {
        let mut config = DaemonConfig::default();
        config.mqtt_mode = MqttMode::Disabled;
        let regulator = regulator_with(config, FakeDevice::offline());

        regulator.regulate(report(250, 1500), 1_000, noon()).await;

        assert!(regulator.notifier().sink().published().is_empty());
    }
}
