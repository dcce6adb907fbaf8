use std::{
    fs::OpenOptions,
    io::ErrorKind,
    path::Path,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use serde::Serialize;
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use regulator_common::{
    parse_timezone, DaemonConfig, MqttConfig, MqttMode, RegulationWindows, SampleReport,
};

use crate::{
    cli::Args,
    events::{EventSink, Notifier},
    modbus::{EcuClient, PowerLimitDevice},
    regulator::{local_time, monotonic_ms, Regulator},
};

type SharedRegulator<D, S> = Arc<Regulator<D, S>>;

#[derive(Debug, Serialize)]
struct MessageBody {
    message: String,
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    init_tracing(&args)?;

    let mut config = match &args.config {
        Some(path) => load_config(path).await.unwrap_or_else(|err| {
            warn!("failed to load {}: {err:#}", path.display());
            DaemonConfig::default()
        }),
        None => DaemonConfig::default(),
    };
    args.apply(&mut config);
    config.mqtt.apply_env(|key| std::env::var(key).ok());
    config.sanitize();

    let windows = RegulationWindows::parse(&config.regulation_windows)
        .context("invalid regulation window")?;
    let timezone = parse_timezone(&config.timezone).unwrap_or_else(|err| {
        warn!("{err}; using local time");
        None
    });

    let device = EcuClient::new(&config.modbus);
    info!(
        "power limit device at {}, slave {}",
        device.endpoint(),
        config.modbus.slave_id
    );

    let sink = match config.mqtt_mode {
        MqttMode::Disabled => None,
        _ => {
            let (mqtt, eventloop) = AsyncClient::new(mqtt_options(&config.mqtt), 64);
            spawn_mqtt_loop(eventloop);
            Some(mqtt)
        }
    };
    let notifier = Notifier::new(sink, config.mqtt_mode, &config.mqtt_root_topic);

    let now = local_time(timezone);
    let regulator = Arc::new(Regulator::new(
        &config,
        windows,
        timezone,
        device,
        notifier,
        monotonic_ms(),
        now,
    ));

    spawn_periodic_loop(
        regulator.clone(),
        Duration::from_secs(config.periodic_task_interval_s),
    );
    spawn_watchdog_loop(regulator.clone());

    let addr = format!("{}:{}", args.http_host, args.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind daemon server at {addr}"))?;

    info!("daemon listening on http://{addr}");
    axum::serve(listener, router(regulator))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("daemon stopped");
    Ok(())
}

pub fn router<D, S>(regulator: SharedRegulator<D, S>) -> Router
where
    D: PowerLimitDevice + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    Router::new()
        .route("/regulate", post(handle_regulate::<D, S>))
        .route("/api/status", get(handle_get_status::<D, S>))
        .with_state(regulator)
}

async fn handle_regulate<D, S>(
    State(regulator): State<SharedRegulator<D, S>>,
    body: Bytes,
) -> Response
where
    D: PowerLimitDevice + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let report = match serde_json::from_slice::<SampleReport>(&body) {
        Ok(report) => report,
        Err(err) => {
            warn!("invalid report: {err}");
            return message_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    let now = regulator.local_time();
    let reply = regulator.regulate(report, monotonic_ms(), now).await;
    (StatusCode::OK, Json(reply)).into_response()
}

async fn handle_get_status<D, S>(State(regulator): State<SharedRegulator<D, S>>) -> Response
where
    D: PowerLimitDevice + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let now = regulator.local_time();
    Json(regulator.status(monotonic_ms(), now).await).into_response()
}

fn spawn_periodic_loop<D, S>(regulator: SharedRegulator<D, S>, period: Duration)
where
    D: PowerLimitDevice + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = regulator.local_time();
            regulator.periodic_tick(monotonic_ms(), now).await;
        }
    });
}

fn spawn_watchdog_loop<D, S>(regulator: SharedRegulator<D, S>)
where
    D: PowerLimitDevice + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            regulator.watchdog_tick(monotonic_ms()).await;
        }
    });
}

fn spawn_mqtt_loop(mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

/// `RUST_LOG` wins over `--loglevel`; `--logfile` replaces stdout.
fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.loglevel.directive()));

    match &args.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(StdMutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<DaemonConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(DaemonConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn mqtt_options(mqtt: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(60));
    if !mqtt.user.is_empty() {
        options.set_credentials(mqtt.user.clone(), mqtt.pass.clone());
    }
    options
}

fn message_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(MessageBody {
            message: message.to_string(),
        }),
    )
        .into_response()
}
