use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use rumqttc::{AsyncClient, Event, Incoming, QoS};
use serde_json::Value;
use tracing::{error, info, warn};

use regulator_common::{topic, TOPIC_ROOT};

use crate::settings;

const CSV_SEPARATOR: u8 = b';';
const RUN_HEADER: [&str; 6] = ["time", "solar", "injection", "conso", "power_limit", "delay"];
const EVENT_HEADER: [&str; 3] = ["time", "code", "message"];

#[derive(Parser, Debug, Clone)]
#[command(
    name = "regulator-mqtt-recorder",
    version,
    about = "Records regulator run summaries and events as CSV"
)]
pub struct Args {
    /// CSV file for run summaries; an empty path disables it.
    #[arg(long, default_value = "solar_power_regulator_run.csv")]
    pub file_infos: String,
    /// CSV file for events; an empty path disables it.
    #[arg(long, default_value = "solar_power_regulator_evt.csv")]
    pub file_evt: String,
    #[arg(short, long)]
    pub user: Option<String>,
    #[arg(short, long)]
    pub password: Option<String>,
    /// Echo run summaries too, not only events.
    #[arg(short, long)]
    pub verbose: bool,
    #[arg(long, default_value = TOPIC_ROOT)]
    pub root_topic: String,
}

/// Semicolon-separated file rewritten with its header on start.
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
}

impl CsvLog {
    pub fn create(path: PathBuf, header: &[&str]) -> anyhow::Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        write_row(file, header)?;
        Ok(Self { path })
    }

    pub fn append(&self, row: &[String]) -> anyhow::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        write_row(file, row)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_row<W: Write>(inner: W, row: &[impl AsRef<[u8]>]) -> anyhow::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(CSV_SEPARATOR)
        .from_writer(inner);
    writer.write_record(row)?;
    writer.flush()?;
    Ok(())
}

fn cell(payload: &Value, key: &str) -> String {
    match payload.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

pub fn run_row(timestamp: &str, payload: &Value) -> Vec<String> {
    let solar = payload.get("solar").and_then(Value::as_i64);
    let injection = payload.get("injection").and_then(Value::as_i64);
    let conso = match (solar, injection) {
        (Some(solar), Some(injection)) => solar.saturating_sub(injection).to_string(),
        _ => String::new(),
    };

    vec![
        timestamp.to_string(),
        cell(payload, "solar"),
        cell(payload, "injection"),
        conso,
        cell(payload, "power_limit"),
        cell(payload, "delay"),
    ]
}

pub fn event_row(timestamp: &str, payload: &Value) -> Vec<String> {
    vec![
        timestamp.to_string(),
        cell(payload, "code"),
        cell(payload, "msg"),
    ]
}

pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[derive(Debug)]
pub struct Recorder {
    run_topic: String,
    event_topic: String,
    run_log: Option<CsvLog>,
    event_log: Option<CsvLog>,
    verbose: bool,
}

impl Recorder {
    pub fn new(
        root_topic: &str,
        run_log: Option<CsvLog>,
        event_log: Option<CsvLog>,
        verbose: bool,
    ) -> Self {
        Self {
            run_topic: topic(root_topic, "run"),
            event_topic: topic(root_topic, "evt"),
            run_log,
            event_log,
            verbose,
        }
    }

    pub fn topics(&self) -> [&str; 2] {
        [&self.run_topic, &self.event_topic]
    }

    pub fn record(&self, topic: &str, payload: &[u8], timestamp: &str) -> anyhow::Result<()> {
        if topic != self.run_topic && topic != self.event_topic {
            return Ok(());
        }
        let payload: Value =
            serde_json::from_slice(payload).context("payload is not valid JSON")?;

        if topic == self.run_topic {
            let row = run_row(timestamp, &payload);
            if self.verbose {
                info!(
                    "[RUN] solar {}W, injection {}W, conso {}W, limit {}%",
                    row[1], row[2], row[3], row[4]
                );
            }
            if let Some(log) = &self.run_log {
                log.append(&row)?;
            }
        } else {
            let row = event_row(timestamp, &payload);
            info!("[EVT] code {}, {}", row[1], row[2]);
            if let Some(log) = &self.event_log {
                log.append(&row)?;
            }
        }
        Ok(())
    }
}

fn open_log(path: &str, header: &[&str], what: &str) -> anyhow::Result<Option<CsvLog>> {
    if path.trim().is_empty() {
        info!("{what} not recorded");
        return Ok(None);
    }
    info!("recording {what} in {path}");
    CsvLog::create(PathBuf::from(path), header).map(Some)
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let (runtime, load_error) = settings::resolve_runtime_config().await;
    settings::init_tracing(runtime.reporter.debug);
    if let Some(err) = load_error {
        warn!("{err:#}; using defaults");
    }

    let run_log = open_log(&args.file_infos, &RUN_HEADER, "run summaries")?;
    let event_log = open_log(&args.file_evt, &EVENT_HEADER, "events")?;
    if !args.verbose {
        info!("only events are echoed; pass --verbose to see run summaries");
    }
    let recorder = Recorder::new(&args.root_topic, run_log, event_log, args.verbose);

    let mut mqtt_config = runtime.mqtt;
    if let Some(user) = args.user {
        mqtt_config.user = user;
    }
    if let Some(password) = args.password {
        mqtt_config.pass = password;
    }
    mqtt_config.client_id = format!("{}-recorder", mqtt_config.client_id);

    info!(
        host = %mqtt_config.host,
        port = mqtt_config.port,
        "mqtt recorder started"
    );
    let (mqtt, mut eventloop) = AsyncClient::new(settings::mqtt_options(&mqtt_config), 32);

    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("mqtt recorder stopped");
                return Ok(());
            }
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
                for topic in recorder.topics() {
                    if let Err(err) = mqtt.try_subscribe(topic, QoS::AtMostOnce) {
                        warn!("subscribe to {topic} failed: {err}");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = String::from_utf8_lossy(publish.topic.as_ref()).into_owned();
                if let Err(err) = recorder.record(&topic, &publish.payload, &timestamp()) {
                    error!("message on {topic} not recorded: {err:#}");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("recorder mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
