use chrono::{NaiveTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown time zone {0:?}")]
pub struct UnknownTimezone(pub String);

/// Empty means the host's local zone.
pub fn parse_timezone(name: &str) -> Result<Option<Tz>, UnknownTimezone> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(None);
    }
    name.parse::<Tz>()
        .map(Some)
        .map_err(|_| UnknownTimezone(name.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightWindow {
    pub enabled: bool,
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for NightWindow {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 22,
            end_hour: 6,
        }
    }
}

impl NightWindow {
    /// Whether `hour` falls in `[start, end)`, wrapping past midnight.
    pub fn contains(&self, hour: u32) -> bool {
        if !self.enabled {
            return false;
        }

        let start = u32::from(self.start_hour);
        let end = u32::from(self.end_hour);
        if start <= end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        }
    }

    pub fn sanitize(&mut self) {
        self.start_hour = self.start_hour.min(23);
        self.end_hour = self.end_hour.min(23);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowParseError {
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
}

/// Daily wall-clock window, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self, WindowParseError> {
        Ok(Self {
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        let now = truncate_to_minute(now);
        if self.start <= self.end {
            self.start <= now && now <= self.end
        } else {
            self.start <= now || now <= self.end
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegulationWindows {
    windows: Vec<TimeWindow>,
}

impl RegulationWindows {
    pub fn parse(raw: &[(String, String)]) -> Result<Self, WindowParseError> {
        let windows = raw
            .iter()
            .map(|(start, end)| TimeWindow::parse(start, end))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { windows })
    }

    pub fn always() -> Self {
        Self::default()
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        self.windows.is_empty() || self.windows.iter().any(|window| window.contains(now))
    }
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime, WindowParseError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| WindowParseError::InvalidTime(raw.to_string()))
}

// Windows are configured with minute resolution.
fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    time.with_second(0)
        .and_then(|time| time.with_nanosecond(0))
        .unwrap_or(time)
}
