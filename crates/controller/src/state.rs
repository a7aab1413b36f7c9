//! In-process status: a bounded event ring plus the last decision
//! outcome. This is the write-only log sink the core components report
//! into; recording never fails and never blocks a tick.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::engine::DecisionOutcome;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedStatus = Arc<RwLock<SystemStatus>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Decision,
    Pump,
    Calibration,
    Config,
    System,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

pub struct SystemStatus {
    started_at: Instant,
    pub last_outcome: Option<DecisionOutcome>,
    pub ticks: u64,
    events: VecDeque<SystemEvent>,
}

impl SystemStatus {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_outcome: None,
            ticks: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }

    pub fn record_outcome(&mut self, outcome: DecisionOutcome) {
        self.ticks += 1;
        self.record(EventKind::Decision, outcome.summary());
        self.last_outcome = Some(outcome);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Newest first, for the status API.
    pub fn events_newest_first(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> DecisionOutcome {
        DecisionOutcome {
            at: OffsetDateTime::now_utc(),
            past_sunset: false,
            temperature_ok: true,
            water_level_ok: true,
            zones: Vec::new(),
            watered: None,
        }
    }

    #[tokio::test]
    async fn record_outcome_updates_last_and_counts() {
        let mut status = SystemStatus::new();
        status.record_outcome(outcome());
        status.record_outcome(outcome());

        assert_eq!(status.ticks, 2);
        assert!(status.last_outcome.is_some());
        let events = status.events_newest_first();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Decision);
        assert_eq!(events[0].detail, "waiting for sunset");
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let mut status = SystemStatus::new();
        for i in 0..(MAX_EVENTS + 25) {
            status.record(EventKind::System, format!("event {i}"));
        }
        let events = status.events_newest_first();
        assert_eq!(events.len(), MAX_EVENTS);
        // Oldest entries were dropped.
        assert_eq!(events.last().unwrap().detail, "event 25");
        assert_eq!(events[0].detail, format!("event {}", MAX_EVENTS + 24));
    }
}
