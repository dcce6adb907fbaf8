use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::Mutex,
};

use crate::{
    client::{DaemonReply, DaemonTransport, TransportError},
    meter::{MeterError, PowerMeter},
};
use regulator_common::SampleReport;

#[derive(Debug, Default)]
pub struct FakeMeter {
    readings: HashMap<String, Option<f64>>,
    reads: Mutex<Vec<String>>,
}

impl FakeMeter {
    pub fn with(mut self, sensor_id: &str, watts: Option<f64>) -> Self {
        self.readings.insert(sensor_id.to_string(), watts);
        self
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }
}

impl PowerMeter for FakeMeter {
    async fn active_power(&self, sensor_id: &str) -> Result<f64, MeterError> {
        self.reads.lock().unwrap().push(sensor_id.to_string());
        match self.readings.get(sensor_id) {
            Some(Some(watts)) => Ok(*watts),
            Some(None) => Err(MeterError::MissingPower(sensor_id.to_string())),
            None => Err(MeterError::MissingComponent(sensor_id.to_string())),
        }
    }
}

/// Daemon stub answering from a queue; an empty queue repeats the fallback body.
#[derive(Debug)]
pub struct FakeDaemon {
    replies: Mutex<VecDeque<Option<String>>>,
    fallback: String,
    sent: Mutex<Vec<SampleReport>>,
}

impl FakeDaemon {
    pub fn answering(body: &str) -> Self {
        Self {
            replies: Mutex::default(),
            fallback: body.to_string(),
            sent: Mutex::default(),
        }
    }

    /// Queues one reply; `None` makes that request fail at transport level.
    pub fn then(self, reply: Option<&str>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(reply.map(str::to_string));
        self
    }

    pub fn sent(&self) -> Vec<SampleReport> {
        self.sent.lock().unwrap().clone()
    }
}

impl DaemonTransport for FakeDaemon {
    async fn post_report(&self, report: &SampleReport) -> Result<DaemonReply, TransportError> {
        self.sent.lock().unwrap().push(*report);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Some(body)) => Ok(DaemonReply { status: 200, body }),
            Some(None) => Err(refused()),
            None => Ok(DaemonReply {
                status: 200,
                body: self.fallback.clone(),
            }),
        }
    }
}

fn refused() -> TransportError {
    TransportError {
        url: "http://daemon.invalid/regulate".to_string(),
        source: Box::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        )),
    }
}
