use serde::{Deserialize, Serialize};

use crate::{topics::TOPIC_ROOT, topics::TOPIC_RUN, window::NightWindow};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NightModeConfig {
    pub enabled: bool,
    pub start_hour: u8,
    pub end_hour: u8,
    pub interval_s: u64,
}

impl Default for NightModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 22,
            end_hour: 6,
            interval_s: 900,
        }
    }
}

impl NightModeConfig {
    pub fn window(&self) -> NightWindow {
        let mut window = NightWindow {
            enabled: self.enabled,
            start_hour: self.start_hour,
            end_hour: self.end_hour,
        };
        window.sanitize();
        window
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub daemon_url: String,
    pub meter_url: String,
    pub grid_sensor_id: String,
    /// Empty when no production meter is wired.
    pub solar_sensor_id: String,
    pub grid_reverse_measure: bool,
    pub default_request_interval_s: u64,
    pub pause_on_error_s: u64,
    pub request_timeout_s: u64,
    pub send_delay_request: bool,
    /// A solar reading of exactly 0 W is reported as unavailable (-1).
    pub solar_zero_is_unavailable: bool,
    pub night_mode: NightModeConfig,
    pub timezone: String,
    pub debug: bool,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            daemon_url: "http://192.168.1.147:8000/regulate".to_string(),
            meter_url: "http://192.168.1.50".to_string(),
            grid_sensor_id: "em1:0".to_string(),
            solar_sensor_id: "em1:1".to_string(),
            grid_reverse_measure: true,
            default_request_interval_s: 5,
            pause_on_error_s: 60,
            request_timeout_s: 10,
            send_delay_request: true,
            solar_zero_is_unavailable: true,
            night_mode: NightModeConfig::default(),
            timezone: String::new(),
            debug: true,
        }
    }
}

impl ReporterConfig {
    pub fn solar_sensor(&self) -> Option<&str> {
        let id = self.solar_sensor_id.trim();
        (!id.is_empty()).then_some(id)
    }

    pub fn sanitize(&mut self) {
        self.default_request_interval_s = self.default_request_interval_s.max(1);
        self.pause_on_error_s = self.pause_on_error_s.max(1);
        self.request_timeout_s = self.request_timeout_s.clamp(1, 60);
        self.night_mode.interval_s = self.night_mode.interval_s.max(1);
        self.night_mode.start_hour = self.night_mode.start_hour.min(23);
        self.night_mode.end_hour = self.night_mode.end_hour.min(23);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub interval_ms: u64,
    pub topic: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            topic: TOPIC_RUN.to_string(),
        }
    }
}

impl PublisherConfig {
    pub fn sanitize(&mut self) {
        self.interval_ms = self.interval_ms.max(100);
        if self.topic.trim().is_empty() {
            self.topic = TOPIC_RUN.to_string();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub client_id: String,
}

impl MqttConfig {
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.port = port;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.user = user;
        }
        if let Some(pass) = lookup("MQTT_PASS") {
            self.pass = pass;
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            client_id: "solar-power-regulator".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub reporter: ReporterConfig,
    pub publisher: PublisherConfig,
    pub mqtt: MqttConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.reporter.sanitize();
        self.publisher.sanitize();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdStep {
    /// Lower bound of the band, in watts of injection.
    pub min_injection_w: i64,
    /// Change applied to the power limit, in per-mille.
    pub increment: i32,
    /// Delay to suggest to the reporter; -1 lets it use its own default.
    pub interval_s: i32,
}

impl ThresholdStep {
    const fn new(min_injection_w: i64, increment: i32, interval_s: i32) -> Self {
        Self {
            min_injection_w,
            increment,
            interval_s,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastDropConfig {
    pub enabled: bool,
    pub injection_above_w: i64,
    pub consecutive: u32,
    pub limit_above: i32,
    pub interval_s: i32,
}

impl Default for FastDropConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            injection_above_w: 30,
            consecutive: 2,
            limit_above: 500,
            interval_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastRiseConfig {
    pub enabled: bool,
    pub injection_below_w: i64,
    pub consecutive: u32,
    pub new_limit: i32,
    pub interval_s: i32,
}

impl Default for FastRiseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            injection_below_w: -800,
            consecutive: 2,
            new_limit: 1000,
            interval_s: 10,
        }
    }
}

/// Tuning of the power-limit algorithm. Limits are in per-mille of rated output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulationConfig {
    pub total_rated_solar_power_w: u32,
    pub min_power_limit: i32,
    pub max_power_limit: i32,
    /// Value the inverter gateway misreports; never written.
    pub buggy_limit: i32,
    pub thresholds: Vec<ThresholdStep>,
    pub consecutive_import_count_for_reset: u32,
    pub fast_drop: FastDropConfig,
    pub fast_rise: FastRiseConfig,
    pub fast_cooldown_reports: u32,
    pub recurrent_error_count: u32,
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self {
            total_rated_solar_power_w: 2640,
            min_power_limit: 10,
            max_power_limit: 1000,
            buggy_limit: 300,
            thresholds: vec![
                ThresholdStep::new(600, -200, 5),
                ThresholdStep::new(250, -100, 5),
                ThresholdStep::new(130, -50, 5),
                ThresholdStep::new(60, -10, 5),
                ThresholdStep::new(30, -5, -1),
                ThresholdStep::new(0, 0, -1),
                ThresholdStep::new(-30, 10, -1),
                ThresholdStep::new(-100, 20, 5),
                ThresholdStep::new(-200, 50, 5),
                ThresholdStep::new(-600, 100, 5),
                ThresholdStep::new(-99_999, 200, 5),
            ],
            consecutive_import_count_for_reset: 15,
            fast_drop: FastDropConfig::default(),
            fast_rise: FastRiseConfig::default(),
            fast_cooldown_reports: 5,
            recurrent_error_count: 5,
        }
    }
}

impl RegulationConfig {
    pub fn sanitize(&mut self) {
        // Band lookup relies on descending order.
        self.thresholds
            .sort_by(|a, b| b.min_injection_w.cmp(&a.min_injection_w));
        self.thresholds.dedup_by_key(|step| step.min_injection_w);

        self.max_power_limit = self.max_power_limit.clamp(1, 1000);
        self.min_power_limit = self.min_power_limit.clamp(0, self.max_power_limit);
        self.total_rated_solar_power_w = self.total_rated_solar_power_w.max(1);
        self.recurrent_error_count = self.recurrent_error_count.max(1);
        self.fast_drop.consecutive = self.fast_drop.consecutive.max(1);
        self.fast_rise.consecutive = self.fast_rise.consecutive.max(1);
        self.fast_rise.new_limit = self
            .fast_rise
            .new_limit
            .clamp(self.min_power_limit, self.max_power_limit);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttMode {
    Disabled,
    All,
    Events,
}

impl MqttMode {
    pub fn publishes_runs(self) -> bool {
        self == Self::All
    }

    pub fn publishes_events(self) -> bool {
        self != Self::Disabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub host: String,
    pub port: u16,
    pub slave_id: u8,
    pub power_limit_register: u16,
    pub timeout_s: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.120".to_string(),
            port: 502,
            slave_id: 1,
            power_limit_register: 40189,
            timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub regulation: RegulationConfig,
    /// `("HH:MM", "HH:MM")` pairs; empty regulates around the clock.
    pub regulation_windows: Vec<(String, String)>,
    pub timezone: String,
    pub periodic_read_interval_s: u64,
    pub watchdog_timeout_s: u64,
    pub periodic_task_interval_s: u64,
    pub modbus: ModbusConfig,
    pub mqtt: MqttConfig,
    pub mqtt_mode: MqttMode,
    pub mqtt_root_topic: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            regulation: RegulationConfig::default(),
            regulation_windows: vec![("06:00".to_string(), "22:00".to_string())],
            timezone: String::new(),
            periodic_read_interval_s: 900,
            watchdog_timeout_s: 3600,
            periodic_task_interval_s: 60,
            modbus: ModbusConfig::default(),
            mqtt: MqttConfig {
                client_id: "solar-power-regulator-daemon".to_string(),
                ..MqttConfig::default()
            },
            mqtt_mode: MqttMode::All,
            mqtt_root_topic: TOPIC_ROOT.to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn sanitize(&mut self) {
        self.regulation.sanitize();
        self.periodic_task_interval_s = self.periodic_task_interval_s.max(1);
        self.periodic_read_interval_s = self.periodic_read_interval_s.max(1);
        self.watchdog_timeout_s = self.watchdog_timeout_s.max(60);
        self.modbus.timeout_s = self.modbus.timeout_s.clamp(1, 60);
        if self.mqtt_root_topic.trim().is_empty() {
            self.mqtt_root_topic = TOPIC_ROOT.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_solar_id_means_unconfigured() {
        let mut config = ReporterConfig::default();
        assert_eq!(config.solar_sensor(), Some("em1:1"));

        config.solar_sensor_id = "  ".to_string();
        assert_eq!(config.solar_sensor(), None);
    }

    #[test]
    fn sanitize_keeps_intervals_positive() {
        let mut config = ReporterConfig {
            default_request_interval_s: 0,
            pause_on_error_s: 0,
            request_timeout_s: 600,
            ..ReporterConfig::default()
        };
        config.night_mode.interval_s = 0;
        config.night_mode.start_hour = 30;
        config.sanitize();

        assert_eq!(config.default_request_interval_s, 1);
        assert_eq!(config.pause_on_error_s, 1);
        assert_eq!(config.request_timeout_s, 60);
        assert_eq!(config.night_mode.interval_s, 1);
        assert_eq!(config.night_mode.start_hour, 23);
    }

    #[test]
    fn thresholds_are_sorted_descending() {
        let mut config = RegulationConfig {
            thresholds: vec![
                ThresholdStep::new(-100, 20, 5),
                ThresholdStep::new(600, -200, 5),
                ThresholdStep::new(0, 0, -1),
            ],
            ..RegulationConfig::default()
        };
        config.sanitize();

        let bounds: Vec<i64> = config
            .thresholds
            .iter()
            .map(|step| step.min_injection_w)
            .collect();
        assert_eq!(bounds, vec![600, 0, -100]);
    }

    #[test]
    fn runtime_config_accepts_partial_files() {
        let raw = r#"{
            "reporter": {
                "daemon_url": "http://10.0.0.2:8000/regulate",
                "solar_sensor_id": "",
                "night_mode": {"enabled": false}
            }
        }"#;
        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.reporter.daemon_url, "http://10.0.0.2:8000/regulate");
        assert_eq!(config.reporter.solar_sensor(), None);
        assert_eq!(config.reporter.grid_sensor_id, "em1:0");
        assert!(!config.reporter.night_mode.enabled);
        assert_eq!(config.reporter.night_mode.interval_s, 900);
        assert_eq!(config.publisher.interval_ms, 500);
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn mqtt_env_overrides() {
        let mut mqtt = MqttConfig::default();
        mqtt.apply_env(|key| match key {
            "MQTT_HOST" => Some("broker.lan".to_string()),
            "MQTT_PORT" => Some("not-a-port".to_string()),
            "MQTT_PASS" => Some("secret".to_string()),
            _ => None,
        });

        assert_eq!(mqtt.host, "broker.lan");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.user, "");
        assert_eq!(mqtt.pass, "secret");

        mqtt.apply_env(|key| (key == "MQTT_PORT").then(|| "8883".to_string()));
        assert_eq!(mqtt.port, 8883);
        assert_eq!(mqtt.host, "broker.lan");
    }

    #[test]
    fn mqtt_modes() {
        assert!(MqttMode::All.publishes_runs());
        assert!(MqttMode::All.publishes_events());
        assert!(!MqttMode::Events.publishes_runs());
        assert!(MqttMode::Events.publishes_events());
        assert!(!MqttMode::Disabled.publishes_events());
    }
}
