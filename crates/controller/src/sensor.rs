//! Converts raw channel samples into normalized physical readings using
//! the calibration store. A board fault or missing calibration yields an
//! invalid reading, never an error: a bad sensor must not abort the tick
//! that observed it.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::db::{CalibrationBounds, CalibrationStore};
use crate::gpio::{Board, Channel, IoError, ZoneId};

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub raw: i64,
    /// Percentage for soil/level, °C for the temperature channel.
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingFault {
    Io(IoError),
    Uncalibrated,
}

impl fmt::Display for ReadingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingFault::Io(e) => write!(f, "sensor i/o: {e}"),
            ReadingFault::Uncalibrated => write!(f, "uncalibrated"),
        }
    }
}

/// One poll of one channel. Immutable; superseded by the next poll.
#[derive(Debug, Clone)]
pub struct Reading {
    pub channel: Channel,
    pub taken_at: OffsetDateTime,
    pub sample: Result<Sample, ReadingFault>,
}

impl Reading {
    pub fn is_valid(&self) -> bool {
        self.sample.is_ok()
    }

    pub fn value(&self) -> Option<f64> {
        self.sample.as_ref().ok().map(|s| s.value)
    }

    pub fn view(&self) -> ReadingView {
        ReadingView {
            channel: self.channel,
            at: self.taken_at,
            raw: self.sample.as_ref().ok().map(|s| s.raw),
            value: self.value(),
            valid: self.is_valid(),
            fault: self.sample.as_ref().err().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadingView {
    pub channel: Channel,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub raw: Option<i64>,
    pub value: Option<f64>,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

/// Everything the decision engine looks at in one tick.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub taken_at: OffsetDateTime,
    pub soil: [Reading; 4],
    pub level: Reading,
    pub temperature: Reading,
}

impl Snapshot {
    pub fn soil(&self, zone: ZoneId) -> &Reading {
        &self.soil[zone.index()]
    }

    pub fn views(&self) -> Vec<ReadingView> {
        let mut views: Vec<_> = self.soil.iter().map(Reading::view).collect();
        views.push(self.level.view());
        views.push(self.temperature.view());
        views
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Map a raw sample onto 0..=100% within the calibration bounds. Out of
/// range readings clamp instead of producing nonsensical percentages.
pub fn normalize(raw: i64, bounds: &CalibrationBounds) -> f64 {
    let span = bounds.raw_high - bounds.raw_low;
    let pct = 100.0 * (raw - bounds.raw_low) as f64 / span as f64;
    pct.clamp(0.0, 100.0)
}

/// The temperature source reports millidegrees; no calibration involved.
pub fn temperature_celsius(raw: i64) -> f64 {
    raw as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SensorReader {
    board: Arc<dyn Board>,
    store: CalibrationStore,
}

impl SensorReader {
    pub fn new(board: Arc<dyn Board>, store: CalibrationStore) -> Self {
        Self { board, store }
    }

    /// Acquire one raw sample and normalize it. Uncalibrated percentage
    /// channels report invalid rather than a meaningless number.
    pub fn read(&self, channel: Channel) -> Reading {
        Reading {
            channel,
            taken_at: OffsetDateTime::now_utc(),
            sample: self.sample(channel),
        }
    }

    fn sample(&self, channel: Channel) -> Result<Sample, ReadingFault> {
        let raw = self.board.read_raw(channel).map_err(ReadingFault::Io)?;
        let value = match channel {
            Channel::BoardTemp => temperature_celsius(raw),
            _ => {
                let bounds = self
                    .store
                    .bounds(channel)
                    .ok_or(ReadingFault::Uncalibrated)?;
                normalize(raw, &bounds)
            }
        };
        Ok(Sample { raw, value })
    }

    /// Poll all six channels.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            taken_at: OffsetDateTime::now_utc(),
            soil: ZoneId::ALL.map(|zone| self.read(Channel::Soil(zone))),
            level: self.read(Channel::Level),
            temperature: self.read(Channel::BoardTemp),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
