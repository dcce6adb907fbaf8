use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{Local, Timelike, Utc};
use chrono_tz::Tz;
use rumqttc::MqttOptions;
use tracing_subscriber::EnvFilter;

use regulator_common::{MqttConfig, RuntimeConfig};

const CONFIG_ENV: &str = "REGULATOR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "./.regulator/reporter.json";

/// `RUST_LOG` wins; otherwise the config's debug flag picks the level.
pub fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

pub async fn resolve_runtime_config() -> (RuntimeConfig, Option<anyhow::Error>) {
    let path = config_path();
    let (mut runtime, load_error) = match load_runtime_config(&path).await {
        Ok(runtime) => (runtime, None),
        Err(err) => (
            RuntimeConfig::default(),
            Some(err.context(format!("failed to load {}", path.display()))),
        ),
    };
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();
    (runtime, load_error)
}

pub fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("DAEMON_URL") {
        runtime.reporter.daemon_url = url;
    }
    if let Some(url) = lookup("METER_URL") {
        runtime.reporter.meter_url = url;
    }
    runtime.mqtt.apply_env(lookup);
}

pub fn local_hour(timezone: Option<Tz>) -> u32 {
    match timezone {
        Some(tz) => Utc::now().with_timezone(&tz).hour(),
        None => Local::now().hour(),
    }
}

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if !config.user.is_empty() {
        options.set_credentials(config.user.clone(), config.pass.clone());
    }
    options
}
