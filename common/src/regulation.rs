use crate::{
    config::RegulationConfig,
    types::{EventPayload, ReturnCode, RunPayload},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegulatorEvent {
    WindowEntered,
    WindowExited,
    DeviceErrorStart,
    DeviceErrorEnd,
    BuggyLimitCorrected {
        read: i32,
        forced: i32,
    },
    LimitDiverged {
        read: i32,
        stored: i32,
    },
    FastDrop {
        from: i32,
        to: i32,
        solar: i64,
        injection: i64,
    },
    FastRise {
        from: i32,
        to: i32,
        solar: i64,
        injection: i64,
    },
}

impl RegulatorEvent {
    pub fn code(&self) -> u8 {
        match self {
            Self::WindowEntered => 1,
            Self::WindowExited => 2,
            Self::DeviceErrorStart => 3,
            Self::DeviceErrorEnd => 4,
            Self::BuggyLimitCorrected { .. } => 5,
            Self::LimitDiverged { .. } => 6,
            Self::FastDrop { .. } => 7,
            Self::FastRise { .. } => 8,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::WindowEntered => "REGULATION_WINDOWS_IN".to_string(),
            Self::WindowExited => "REGULATION_WINDOWS_OUT".to_string(),
            Self::DeviceErrorStart => "MODBUS_ERROR_START".to_string(),
            Self::DeviceErrorEnd => "MODBUS_ERROR_END".to_string(),
            Self::BuggyLimitCorrected { read, forced } => format!(
                "POWER_LIMIT_{}. Forced to {}%",
                percent(*read),
                percent(*forced)
            ),
            Self::LimitDiverged { read, stored } => format!(
                "POWER_LIMIT_DIFF. Read={}%, Mem={}%",
                percent(*read),
                percent(*stored)
            ),
            Self::FastDrop {
                from,
                to,
                solar,
                injection,
            } => format!(
                "FAST_DROP. From {}% to {}%. Solar={solar}W, Injection={injection}W",
                percent(*from),
                percent(*to)
            ),
            Self::FastRise {
                from,
                to,
                solar,
                injection,
            } => format!(
                "FAST_RISE. From {}% to {}%. Solar={solar}W, Injection={injection}W",
                percent(*from),
                percent(*to)
            ),
        }
    }

    pub fn payload(&self) -> EventPayload {
        EventPayload {
            code: self.code(),
            msg: self.message(),
        }
    }
}

/// Per-mille limit rendered as a percentage with one decimal.
pub fn percent(permille: i32) -> String {
    format!("{:.1}", f64::from(permille) / 10.0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitDecision {
    /// `None` while the device limit has never been read.
    pub new_limit: Option<i32>,
    pub increment: i32,
    pub band: String,
    /// Delay to suggest to the reporter; -1 lets it use its own default.
    pub next_interval: i32,
    pub event: Option<RegulatorEvent>,
}

impl LimitDecision {
    fn unchanged(limit: Option<i32>, band: impl Into<String>, next_interval: i32) -> Self {
        Self {
            new_limit: limit,
            increment: 0,
            band: band.into(),
            next_interval,
            event: None,
        }
    }

    fn to_limit(last: i32, new_limit: i32, band: impl Into<String>, next_interval: i32) -> Self {
        Self {
            new_limit: Some(new_limit),
            increment: new_limit - last,
            band: band.into(),
            next_interval,
            event: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegulationEngine {
    pub config: RegulationConfig,

    current_limit: Option<i32>,
    consecutive_device_errors: u32,
    last_device_read_ms: Option<u64>,

    last_report_ms: u64,
    watchdog_triggered: bool,
    was_in_window: bool,

    consecutive_import: u32,
    consecutive_high_injection: u32,
    consecutive_deep_import: u32,
    fast_cooldown: u32,

    last_run_payload: Option<RunPayload>,
}

impl RegulationEngine {
    pub fn new(mut config: RegulationConfig, now_ms: u64, in_window: bool) -> Self {
        config.sanitize();
        Self {
            config,
            current_limit: None,
            consecutive_device_errors: 0,
            last_device_read_ms: None,
            last_report_ms: now_ms,
            watchdog_triggered: false,
            was_in_window: in_window,
            consecutive_import: 0,
            consecutive_high_injection: 0,
            consecutive_deep_import: 0,
            fast_cooldown: 0,
            last_run_payload: None,
        }
    }

    pub fn current_limit(&self) -> Option<i32> {
        self.current_limit
    }

    /// Current limit in the wire encoding, -1 when unknown.
    pub fn current_limit_or_unknown(&self) -> i32 {
        self.current_limit.unwrap_or(-1)
    }

    pub fn device_error_count(&self) -> u32 {
        self.consecutive_device_errors
    }

    pub fn is_watchdog_triggered(&self) -> bool {
        self.watchdog_triggered
    }

    pub fn was_in_window(&self) -> bool {
        self.was_in_window
    }

    pub fn last_report_ms(&self) -> u64 {
        self.last_report_ms
    }

    pub fn calculate(&mut self, injection: i64, solar: i64) -> LimitDecision {
        let Some(last) = self.current_limit else {
            return LimitDecision::unchanged(None, "unknown state", -1);
        };

        self.fast_cooldown = self.fast_cooldown.saturating_sub(1);

        if let Some(decision) = self.fast_rise(last, injection, solar) {
            return decision;
        }
        if let Some(decision) = self.fast_drop(last, injection, solar) {
            return decision;
        }
        if let Some(decision) = self.import_lock(last, injection) {
            return decision;
        }

        self.threshold_step(last, injection)
    }

    fn fast_rise(&mut self, last: i32, injection: i64, solar: i64) -> Option<LimitDecision> {
        let rise = &self.config.fast_rise;
        if !rise.enabled {
            return None;
        }

        if injection < rise.injection_below_w {
            self.consecutive_deep_import += 1;
        } else {
            self.consecutive_deep_import = 0;
        }

        if self.consecutive_deep_import < rise.consecutive
            || self.fast_cooldown != 0
            || last >= rise.new_limit
        {
            return None;
        }

        let to = rise.new_limit;
        let mut decision = LimitDecision::to_limit(last, to, "very high import", rise.interval_s);
        decision.event = Some(RegulatorEvent::FastRise {
            from: last,
            to,
            solar,
            injection,
        });
        self.fast_cooldown = self.config.fast_cooldown_reports;
        self.consecutive_deep_import = 0;
        Some(decision)
    }

    fn fast_drop(&mut self, last: i32, injection: i64, solar: i64) -> Option<LimitDecision> {
        let drop = &self.config.fast_drop;
        if !drop.enabled {
            return None;
        }

        if injection > drop.injection_above_w {
            self.consecutive_high_injection += 1;
        } else {
            self.consecutive_high_injection = 0;
        }

        if self.consecutive_high_injection < drop.consecutive
            || last <= drop.limit_above
            || solar <= 0
            || self.fast_cooldown != 0
        {
            return None;
        }

        let consumed = (solar - injection) as f64;
        let estimated = (consumed / f64::from(self.config.total_rated_solar_power_w) * 1000.0)
            .trunc() as i32;
        let estimated = estimated.clamp(self.config.min_power_limit, self.config.max_power_limit);
        if estimated >= last {
            return None;
        }

        let mut decision =
            LimitDecision::to_limit(last, estimated, "high injection", drop.interval_s);
        decision.event = Some(RegulatorEvent::FastDrop {
            from: last,
            to: estimated,
            solar,
            injection,
        });
        self.fast_cooldown = self.config.fast_cooldown_reports;
        self.consecutive_high_injection = 0;
        Some(decision)
    }

    fn import_lock(&mut self, last: i32, injection: i64) -> Option<LimitDecision> {
        if injection >= 0 {
            self.consecutive_import = 0;
            return None;
        }

        self.consecutive_import += 1;
        if self.consecutive_import < self.config.consecutive_import_count_for_reset {
            return None;
        }

        self.consecutive_import = 0;
        Some(LimitDecision::to_limit(
            last,
            self.config.max_power_limit,
            "continuous import",
            -1,
        ))
    }

    fn threshold_step(&self, last: i32, injection: i64) -> LimitDecision {
        let thresholds = &self.config.thresholds;
        let Some(index) = thresholds
            .iter()
            .position(|step| injection >= step.min_injection_w)
        else {
            return LimitDecision::unchanged(Some(last), "out of range", -1);
        };

        let step = thresholds[index];
        let band = match index.checked_sub(1).map(|upper| thresholds[upper]) {
            Some(upper) => format!("{}W..<{}W", step.min_injection_w, upper.min_injection_w),
            None => format!(">{}W", step.min_injection_w),
        };

        if step.increment == 0 {
            return LimitDecision::unchanged(Some(last), band, step.interval_s);
        }

        let max = self.config.max_power_limit;
        let mut new_limit = (last + step.increment).clamp(self.config.min_power_limit, max);
        let mut interval = step.interval_s;
        if last == max && new_limit == max {
            interval = -1;
        }
        if new_limit == self.config.buggy_limit {
            new_limit += if step.increment > 0 { 5 } else { -5 };
        }

        LimitDecision::to_limit(last, new_limit, band, interval)
    }

    pub fn write_value(&self, limit: i32) -> i32 {
        let mut value = limit;
        if value == self.config.buggy_limit {
            value += 1;
        }
        value.max(self.config.min_power_limit)
    }

    pub fn is_buggy_read(&self, value: i32) -> bool {
        value == self.config.buggy_limit
    }

    pub fn record_read_ok(&mut self, now_ms: u64) -> Vec<RegulatorEvent> {
        let mut events = Vec::new();
        if self.consecutive_device_errors > 0 {
            events.push(RegulatorEvent::DeviceErrorEnd);
        }
        self.consecutive_device_errors = 0;
        self.last_device_read_ms = Some(now_ms);
        events
    }

    pub fn accept_read_limit(&mut self, value: i32) -> (ReturnCode, Option<RegulatorEvent>) {
        let mut code = ReturnCode::Ok;
        let mut event = None;
        if let Some(stored) = self.current_limit {
            if stored != value {
                code = ReturnCode::DifferentPowerLimit;
                event = Some(RegulatorEvent::LimitDiverged {
                    read: value,
                    stored,
                });
            }
        }
        self.current_limit = Some(value);
        (code, event)
    }

    pub fn record_read_failed(&mut self) -> (ReturnCode, Vec<RegulatorEvent>) {
        let events = self.record_device_error();
        let code = if self.consecutive_device_errors >= self.config.recurrent_error_count {
            ReturnCode::ModbusRecurrentFailure
        } else {
            ReturnCode::ModbusFailure
        };
        (code, events)
    }

    pub fn record_write_ok(&mut self, written: i32) -> Vec<RegulatorEvent> {
        let mut events = Vec::new();
        if self.consecutive_device_errors > 0 {
            events.push(RegulatorEvent::DeviceErrorEnd);
        }
        self.current_limit = Some(written);
        self.consecutive_device_errors = 0;
        events
    }

    pub fn record_write_failed(&mut self) -> Vec<RegulatorEvent> {
        self.record_device_error()
    }

    fn record_device_error(&mut self) -> Vec<RegulatorEvent> {
        let mut events = Vec::new();
        if self.consecutive_device_errors == 0 {
            events.push(RegulatorEvent::DeviceErrorStart);
        }
        self.consecutive_device_errors = self.consecutive_device_errors.saturating_add(1);
        events
    }

    /// Marks a reporter request; returns true when it ends a watchdog episode.
    pub fn note_report(&mut self, now_ms: u64) -> bool {
        self.last_report_ms = now_ms;
        std::mem::replace(&mut self.watchdog_triggered, false)
    }

    pub fn watchdog_due(&self, now_ms: u64, timeout_ms: u64) -> bool {
        !self.watchdog_triggered && now_ms.saturating_sub(self.last_report_ms) > timeout_ms
    }

    pub fn mark_watchdog_triggered(&mut self) {
        self.watchdog_triggered = true;
    }

    pub fn window_transition(&mut self, in_window: bool) -> Option<RegulatorEvent> {
        if in_window == self.was_in_window {
            return None;
        }
        self.was_in_window = in_window;
        Some(if in_window {
            RegulatorEvent::WindowEntered
        } else {
            RegulatorEvent::WindowExited
        })
    }

    pub fn periodic_read_due(&self, in_window: bool, now_ms: u64, interval_ms: u64) -> bool {
        in_window
            && self
                .last_device_read_ms
                .map(|last| now_ms.saturating_sub(last) > interval_ms)
                .unwrap_or(true)
    }

    /// Returns true when `payload` differs from the last published one.
    pub fn take_run_payload(&mut self, payload: RunPayload) -> bool {
        if self.last_run_payload == Some(payload) {
            return false;
        }
        self.last_run_payload = Some(payload);
        true
    }
}
