pub mod config;
pub mod cycle;
pub mod regulation;
pub mod topics;
pub mod types;
pub mod window;

pub use config::{
    DaemonConfig, ModbusConfig, MqttConfig, MqttMode, PublisherConfig, RegulationConfig,
    ReporterConfig, RuntimeConfig,
};
pub use cycle::{
    build_report, is_night, normalize_injection, solar_or_unavailable, whole_seconds, CycleError,
    CycleReason, NextCycle, MAX_CYCLE_DELAY, SOLAR_UNAVAILABLE,
};
pub use regulation::{LimitDecision, RegulationEngine, RegulatorEvent};
pub use topics::*;
pub use types::{
    DaemonResponse, EventPayload, MqttSample, RegulateReply, ReturnCode, RunPayload, SampleReport,
};
pub use window::{parse_timezone, NightWindow, RegulationWindows, TimeWindow, UnknownTimezone};
