use rumqttc::{AsyncClient, QoS};
use tracing::{debug, warn};

use regulator_common::{topics::topic, MqttMode, RegulatorEvent, RunPayload};

/// Fire-and-forget publication; failures are logged by the sink.
pub trait EventSink {
    fn publish(&self, topic: &str, payload: Vec<u8>);
}

impl EventSink for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) {
        if let Err(err) = self.try_publish(topic, QoS::AtMostOnce, false, payload) {
            warn!("mqtt publish on {topic} failed: {err}");
        }
    }
}

impl<S: EventSink> EventSink for Option<S> {
    fn publish(&self, topic: &str, payload: Vec<u8>) {
        if let Some(sink) = self {
            sink.publish(topic, payload);
        }
    }
}

#[derive(Debug)]
pub struct Notifier<S> {
    sink: S,
    mode: MqttMode,
    event_topic: String,
    run_topic: String,
}

impl<S: EventSink> Notifier<S> {
    pub fn new(sink: S, mode: MqttMode, root_topic: &str) -> Self {
        Self {
            sink,
            mode,
            event_topic: topic(root_topic, "evt"),
            run_topic: topic(root_topic, "run"),
        }
    }

    pub fn publishes_runs(&self) -> bool {
        self.mode.publishes_runs()
    }

    pub fn event(&self, event: &RegulatorEvent) {
        if !self.mode.publishes_events() {
            return;
        }
        match serde_json::to_vec(&event.payload()) {
            Ok(body) => self.sink.publish(&self.event_topic, body),
            Err(err) => warn!("event serialization failed: {err}"),
        }
    }

    pub fn events(&self, events: impl IntoIterator<Item = RegulatorEvent>) {
        for event in events {
            self.event(&event);
        }
    }

    pub fn run(&self, payload: &RunPayload) {
        if !self.publishes_runs() {
            return;
        }
        debug!(?payload, "publishing run summary");
        match serde_json::to_vec(payload) {
            Ok(body) => self.sink.publish(&self.run_topic, body),
            Err(err) => warn!("run payload serialization failed: {err}"),
        }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }
}
