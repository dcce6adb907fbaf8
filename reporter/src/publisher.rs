use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, QoS};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use regulator_common::{normalize_injection, solar_or_unavailable, MqttSample, ReporterConfig};

use crate::{
    meter::{PowerMeter, ShellyRpcMeter},
    settings,
};

pub async fn read_sample<M: PowerMeter>(meter: &M, config: &ReporterConfig) -> Option<MqttSample> {
    let grid_watts = match meter.active_power(&config.grid_sensor_id).await {
        Ok(watts) if watts.is_finite() => watts,
        Ok(watts) => {
            debug!("grid reading {watts} is not a number, tick skipped");
            return None;
        }
        Err(err) => {
            debug!("grid sensor unreadable, tick skipped: {err}");
            return None;
        }
    };

    let solar_watts = match config.solar_sensor() {
        Some(sensor) => meter.active_power(sensor).await.ok(),
        None => None,
    };

    Some(MqttSample::new(
        normalize_injection(grid_watts, config.grid_reverse_measure),
        solar_or_unavailable(solar_watts, config.solar_zero_is_unavailable),
    ))
}

/// Stalled meter reads push the schedule back instead of bursting samples.
fn sample_ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub async fn run() -> anyhow::Result<()> {
    let (runtime, load_error) = settings::resolve_runtime_config().await;
    settings::init_tracing(runtime.reporter.debug);
    if let Some(err) = load_error {
        warn!("{err:#}; using defaults");
    }

    let config = runtime.reporter;
    let meter = ShellyRpcMeter::new(
        &config.meter_url,
        Duration::from_secs(config.request_timeout_s),
    )?;

    let (mqtt, mut eventloop) = AsyncClient::new(settings::mqtt_options(&runtime.mqtt), 32);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("mqtt connected"),
                Ok(_) => {}
                Err(err) => {
                    warn!("publisher mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = runtime.publisher.topic;
    info!(
        topic = %topic,
        interval_ms = runtime.publisher.interval_ms,
        "mqtt publisher started"
    );

    let mut interval = sample_ticker(Duration::from_millis(runtime.publisher.interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("mqtt publisher stopped");
                return Ok(());
            }
        }

        let Some(sample) = read_sample(&meter, &config).await else {
            continue;
        };

        let payload = serde_json::to_vec(&sample).context("failed to encode sample")?;
        if let Err(err) = mqtt
            .publish(topic.as_str(), QoS::AtMostOnce, false, payload)
            .await
        {
            warn!("sample publish failed: {err}");
        }
    }
}
