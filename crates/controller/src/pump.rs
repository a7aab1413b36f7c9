//! Pump interlock: the single authority over the physical pump output.
//! All watering requests route through `request`; the supervising `tick`
//! cuts power at the runtime cap even if nobody ever calls `stop`. An
//! unconfirmable relay latches `Fault`, which refuses every request until
//! an operator `reset` with the output independently confirmed off.
//!
//! ## State machine
//!
//! ```text
//! Idle ──request──▶ Running ──stop / runtime cap──▶ Cooldown
//!  ▲                                                    │
//!  └───────────────[cooldown elapsed, next check]────────┘
//!
//! any state ──relay unconfirmable──▶ Fault ──reset (output off)──▶ Idle
//! ```
//!
//! `request`, `stop`, `tick` and `reset` serialize on one internal mutex,
//! so a cutoff firing concurrently with a fresh request can never produce
//! two simultaneous "on" states.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::SharedSettings;
use crate::gpio::{Board, IoError, ZoneId};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PumpState {
    Idle,
    Running {
        zone: ZoneId,
        started_at: Instant,
        /// The accepted (clamped) duration; the cutoff deadline.
        duration: Duration,
    },
    Cooldown {
        zone: ZoneId,
        until: Instant,
    },
    Fault {
        reason: String,
        since: OffsetDateTime,
    },
}

/// Per-zone bookkeeping, written only by the interlock when a run
/// completes.
#[derive(Debug, Clone, Copy)]
pub struct ZoneMeta {
    pub zone: ZoneId,
    /// Monotonic stamp used for the cooldown arithmetic.
    pub last_watered: Option<Instant>,
    /// Wall-clock stamp for reporting.
    pub last_watered_at: Option<OffsetDateTime>,
    pub last_duration: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Operation results and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    PumpBusy,
    CooldownActive,
    Faulted,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::PumpBusy => write!(f, "pump busy"),
            RejectReason::CooldownActive => write!(f, "cooldown active"),
            RejectReason::Faulted => write!(f, "pump fault"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Accepted { duration: Duration },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Engine,
    Operator,
    MaxRuntime,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Engine => write!(f, "engine"),
            StopReason::Operator => write!(f, "operator"),
            StopReason::MaxRuntime => write!(f, "max runtime reached"),
            StopReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// State-transition record for the log and notification sinks. Events
/// accumulate inside the interlock and are drained by the scheduler loops,
/// so a slow sink can never block a transition.
#[derive(Debug, Clone)]
pub enum PumpEvent {
    Started { zone: ZoneId, duration: Duration },
    Stopped { zone: ZoneId, runtime: Duration, reason: StopReason },
    CooldownEnded { zone: ZoneId },
    Faulted { reason: String },
    Reset,
}

#[derive(Debug)]
pub enum ResetError {
    NotFaulted,
    OutputStillOn,
    Unconfirmed(IoError),
}

impl fmt::Display for ResetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetError::NotFaulted => write!(f, "interlock is not in a fault state"),
            ResetError::OutputStillOn => write!(f, "pump output still reads on"),
            ResetError::Unconfirmed(e) => write!(f, "cannot confirm pump output: {e}"),
        }
    }
}

impl std::error::Error for ResetError {}

// ---------------------------------------------------------------------------
// Interlock
// ---------------------------------------------------------------------------

struct Inner {
    state: PumpState,
    zones: [ZoneMeta; 4],
    events: Vec<PumpEvent>,
}

pub struct PumpInterlock {
    board: Arc<dyn Board>,
    cfg: SharedSettings,
    inner: Mutex<Inner>,
}

impl PumpInterlock {
    pub fn new(board: Arc<dyn Board>, cfg: SharedSettings) -> Self {
        Self {
            board,
            cfg,
            inner: Mutex::new(Inner {
                state: PumpState::Idle,
                zones: ZoneId::ALL.map(|zone| ZoneMeta {
                    zone,
                    last_watered: None,
                    last_watered_at: None,
                    last_duration: None,
                }),
                events: Vec::new(),
            }),
        }
    }

    /// Ask to water a zone. Precondition order: the pump must be idle
    /// (a lazily expired cooldown counts), the zone must be outside its
    /// own cooldown window, and the duration is capped — never rejected —
    /// at the configured max runtime.
    pub async fn request(&self, zone: ZoneId, requested: Duration) -> RequestOutcome {
        let settings = self.cfg.current();
        let mut g = self.inner.lock().await;
        Self::expire_cooldown(&mut g);

        match g.state {
            PumpState::Running { .. } | PumpState::Cooldown { .. } => {
                return RequestOutcome::Rejected(RejectReason::PumpBusy);
            }
            PumpState::Fault { .. } => {
                return RequestOutcome::Rejected(RejectReason::Faulted);
            }
            PumpState::Idle => {}
        }

        let cooldown = Duration::from_secs(settings.cooldown_s);
        if let Some(t) = g.zones[zone.index()].last_watered {
            if t.elapsed() < cooldown {
                return RequestOutcome::Rejected(RejectReason::CooldownActive);
            }
        }

        let duration = requested.min(Duration::from_secs(settings.max_runtime_s));

        if let Err(e) = self.board.set_pump(true) {
            Self::latch_fault(&mut g, format!("pump on failed: {e}"));
            return RequestOutcome::Rejected(RejectReason::Faulted);
        }
        match self.board.pump_is_on() {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.board.set_pump(false);
                Self::latch_fault(&mut g, "pump output not confirmed on".to_string());
                return RequestOutcome::Rejected(RejectReason::Faulted);
            }
            Err(e) => {
                let _ = self.board.set_pump(false);
                Self::latch_fault(&mut g, format!("pump read-back failed: {e}"));
                return RequestOutcome::Rejected(RejectReason::Faulted);
            }
        }

        g.state = PumpState::Running {
            zone,
            started_at: Instant::now(),
            duration,
        };
        g.events.push(PumpEvent::Started { zone, duration });
        info!(zone = %zone, duration_s = duration.as_secs(), "pump started");
        RequestOutcome::Accepted { duration }
    }

    /// Stop a running pump early. Returns false when nothing was running.
    pub async fn stop(&self, reason: StopReason) -> bool {
        let mut g = self.inner.lock().await;
        self.stop_locked(&mut g, reason)
    }

    fn stop_locked(&self, g: &mut Inner, reason: StopReason) -> bool {
        let PumpState::Running {
            zone, started_at, ..
        } = g.state
        else {
            return false;
        };
        let runtime = started_at.elapsed();

        if let Err(e) = self.board.set_pump(false) {
            Self::latch_fault(g, format!("pump off failed: {e}"));
            return false;
        }

        let meta = &mut g.zones[zone.index()];
        meta.last_watered = Some(Instant::now());
        meta.last_watered_at = Some(OffsetDateTime::now_utc());
        meta.last_duration = Some(runtime);

        let cooldown = Duration::from_secs(self.cfg.current().cooldown_s);
        g.state = PumpState::Cooldown {
            zone,
            until: Instant::now() + cooldown,
        };
        g.events.push(PumpEvent::Stopped {
            zone,
            runtime,
            reason,
        });
        info!(zone = %zone, runtime_s = runtime.as_secs(), reason = %reason, "pump stopped");
        true
    }

    /// The supervising check, driven by the fast health loop independently
    /// of the decision engine. Enforces the runtime cap and retires an
    /// expired cooldown.
    pub async fn tick(&self) {
        let mut g = self.inner.lock().await;
        Self::expire_cooldown(&mut g);
        if let PumpState::Running {
            zone,
            started_at,
            duration,
        } = g.state
        {
            if started_at.elapsed() >= duration {
                warn!(zone = %zone, "max runtime reached — cutting pump");
                self.stop_locked(&mut g, StopReason::MaxRuntime);
            }
        }
    }

    // Checked lazily on request/tick rather than from a timer callback, so
    // a suspended process can't miss the wakeup.
    fn expire_cooldown(g: &mut Inner) {
        if let PumpState::Cooldown { zone, until } = g.state {
            if Instant::now() >= until {
                g.state = PumpState::Idle;
                g.events.push(PumpEvent::CooldownEnded { zone });
                info!(zone = %zone, "cooldown ended");
            }
        }
    }

    fn latch_fault(g: &mut Inner, reason: String) {
        error!(%reason, "pump interlock fault latched");
        g.state = PumpState::Fault {
            reason: reason.clone(),
            since: OffsetDateTime::now_utc(),
        };
        g.events.push(PumpEvent::Faulted { reason });
    }

    /// Clear a latched fault. Only permitted when the read-back confirms
    /// the output is actually off.
    pub async fn reset(&self) -> Result<(), ResetError> {
        let mut g = self.inner.lock().await;
        if !matches!(g.state, PumpState::Fault { .. }) {
            return Err(ResetError::NotFaulted);
        }
        match self.board.pump_is_on() {
            Ok(false) => {
                g.state = PumpState::Idle;
                g.events.push(PumpEvent::Reset);
                info!("pump interlock reset");
                Ok(())
            }
            Ok(true) => Err(ResetError::OutputStillOn),
            Err(e) => Err(ResetError::Unconfirmed(e)),
        }
    }

    /// Shutdown sweep: the output must not stay energised past process
    /// exit. A running pump gets its zone bookkeeping recorded on the way
    /// down.
    pub async fn force_off(&self) {
        let mut g = self.inner.lock().await;
        if matches!(g.state, PumpState::Running { .. }) {
            self.stop_locked(&mut g, StopReason::Shutdown);
        }
        if let Err(e) = self.board.set_pump(false) {
            error!("failed to force pump off: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Observation (read-only for every other component)
    // ------------------------------------------------------------------

    pub async fn state(&self) -> PumpState {
        self.inner.lock().await.state.clone()
    }

    pub async fn zones(&self) -> [ZoneMeta; 4] {
        self.inner.lock().await.zones
    }

    pub async fn drain_events(&self) -> Vec<PumpEvent> {
        std::mem::take(&mut self.inner.lock().await.events)
    }

    pub async fn view(&self) -> PumpView {
        let g = self.inner.lock().await;
        match &g.state {
            PumpState::Idle => PumpView::named("idle"),
            PumpState::Running {
                zone,
                started_at,
                duration,
            } => PumpView {
                zone: Some(*zone),
                running_secs: Some(started_at.elapsed().as_secs()),
                max_runtime_secs: Some(duration.as_secs()),
                ..PumpView::named("running")
            },
            PumpState::Cooldown { zone, until } => PumpView {
                zone: Some(*zone),
                cooldown_remaining_secs: Some(
                    until.saturating_duration_since(Instant::now()).as_secs(),
                ),
                ..PumpView::named("cooldown")
            },
            PumpState::Fault { reason, .. } => PumpView {
                fault_reason: Some(reason.clone()),
                ..PumpView::named("fault")
            },
        }
    }

    pub async fn zone_views(&self) -> Vec<ZoneView> {
        let cooldown = Duration::from_secs(self.cfg.current().cooldown_s);
        let g = self.inner.lock().await;
        g.zones
            .iter()
            .map(|m| ZoneView {
                zone: m.zone,
                last_watered_at: m.last_watered_at,
                last_duration_secs: m.last_duration.map(|d| d.as_secs()),
                cooldown_remaining_secs: m
                    .last_watered
                    .map_or(0, |t| cooldown.saturating_sub(t.elapsed()).as_secs()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Serializable views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PumpView {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<ZoneId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runtime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_reason: Option<String>,
}

impl PumpView {
    fn named(state: &'static str) -> Self {
        Self {
            state,
            zone: None,
            running_secs: None,
            max_runtime_secs: None,
            cooldown_remaining_secs: None,
            fault_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneView {
    pub zone: ZoneId,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_watered_at: Option<OffsetDateTime>,
    pub last_duration_secs: Option<u64>,
    pub cooldown_remaining_secs: u64,
}

// ===========================================================================
// Tests
// ===========================================================================
