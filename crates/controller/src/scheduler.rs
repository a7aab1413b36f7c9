//! Periodic activities: the evaluation loop (watering cadence) and the
//! faster health loop (pump supervising timer, temperature watch, fault
//! re-announcement, calibration timeouts). Both are tokio tasks selecting
//! on the shutdown channel; intervals are re-read every iteration so hot
//! config updates apply on the next tick. The loops share nothing but the
//! interlock's own mutex, so the health loop can cut pump power while an
//! evaluation tick is in flight.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::calib::Calibrator;
use crate::config::SharedSettings;
use crate::db::CalibrationStore;
use crate::engine;
use crate::gpio::Channel;
use crate::notify::{Alert, AlertKind, Notifier};
use crate::pump::{PumpEvent, PumpInterlock, PumpState};
use crate::sensor::SensorReader;
use crate::state::{EventKind, SharedStatus};
use crate::sun::SunsetOracle;

/// Health ticks between repeats of the standing-fault alert
/// (10 minutes at the default 5 s cadence).
const FAULT_RENOTIFY_TICKS: u64 = 120;

/// Everything the loops need, cheap to clone.
#[derive(Clone)]
pub struct Core {
    pub cfg: SharedSettings,
    pub store: CalibrationStore,
    pub reader: SensorReader,
    pub interlock: Arc<PumpInterlock>,
    pub calibrator: Arc<Calibrator>,
    pub sun: Arc<SunsetOracle>,
    pub status: SharedStatus,
    pub notifier: Arc<dyn Notifier>,
}

// ---------------------------------------------------------------------------
// Evaluation loop
// ---------------------------------------------------------------------------

/// Run the watering cadence. Intended to be `tokio::spawn`-ed from main.
pub async fn run_evaluation(core: Core, mut shutdown: watch::Receiver<bool>) {
    info!(
        interval_s = core.cfg.current().eval_interval_s,
        "evaluation loop started"
    );
    loop {
        let interval = Duration::from_secs(core.cfg.current().eval_interval_s);
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        run_tick(&core).await;
    }
    info!("evaluation loop stopped");
}

/// One evaluation tick: snapshot → engine → sinks.
pub async fn run_tick(core: &Core) {
    let cfg = core.cfg.current();
    let snapshot = core.reader.snapshot();
    let past_sunset = core.sun.is_past_sunset();

    let outcome = engine::evaluate(&snapshot, past_sunset, &core.interlock, &cfg).await;

    if !outcome.past_sunset {
        debug!("waiting for sunset");
    } else if !outcome.temperature_ok {
        let msg = match snapshot.temperature.value() {
            Some(t) => format!(
                "board temperature {t:.1}°C at or above limit {:.1}°C",
                cfg.overheat_threshold
            ),
            None => "board temperature reading invalid".to_string(),
        };
        core.notifier.notify(&Alert::new(AlertKind::Overheat, msg));
    } else if !outcome.water_level_ok {
        let msg = match snapshot.level.value() {
            Some(level) => format!(
                "water level {level:.1}% below minimum {:.1}%",
                cfg.min_level_threshold
            ),
            None => "water level reading invalid".to_string(),
        };
        core.notifier.notify(&Alert::new(AlertKind::LowWater, msg));
    }

    forward_pump_events(core, core.interlock.drain_events().await).await;

    info!("evaluation tick: {}", outcome.summary());
    core.status.write().await.record_outcome(outcome);
}

// ---------------------------------------------------------------------------
// Health loop
// ---------------------------------------------------------------------------

/// The safety cadence. Runs the interlock's supervising timer, watches the
/// board temperature, keeps announcing a standing fault, and reaps
/// abandoned calibration sessions.
pub async fn run_health(core: Core, mut shutdown: watch::Receiver<bool>) {
    info!(
        interval_s = core.cfg.current().health_interval_s,
        "health loop started"
    );
    let mut was_hot = false;
    let mut fault_ticks: u64 = 0;

    loop {
        let cfg = core.cfg.current();
        tokio::select! {
            _ = sleep(Duration::from_secs(cfg.health_interval_s)) => {}
            _ = shutdown.changed() => break,
        }

        core.interlock.tick().await;
        forward_pump_events(&core, core.interlock.drain_events().await).await;

        // Temperature watch, edge-triggered so a hot spell alerts once.
        // An invalid reading degrades to "skip this check".
        let temperature = core.reader.read(Channel::BoardTemp);
        if let Some(t) = temperature.value() {
            let hot = t >= cfg.overheat_threshold;
            if hot && !was_hot {
                let msg = format!(
                    "board temperature {t:.1}°C at or above limit {:.1}°C",
                    cfg.overheat_threshold
                );
                core.notifier.notify(&Alert::new(AlertKind::Overheat, msg.clone()));
                core.status.write().await.record(EventKind::Error, msg);
            } else if !hot && was_hot {
                core.status.write().await.record(
                    EventKind::System,
                    format!("board temperature back below limit ({t:.1}°C)"),
                );
            }
            was_hot = hot;
        }

        // A standing fault is an irrigation outage: keep saying so.
        if let PumpState::Fault { reason, .. } = core.interlock.state().await {
            if fault_ticks % FAULT_RENOTIFY_TICKS == 0 {
                core.notifier.notify(&Alert::new(
                    AlertKind::Fault,
                    format!("pump interlock fault standing: {reason} — reset required"),
                ));
            }
            fault_ticks += 1;
        } else {
            fault_ticks = 0;
        }

        for channel in core.calibrator.sweep_timeouts().await {
            core.status.write().await.record(
                EventKind::Calibration,
                format!("calibration session for {channel} timed out"),
            );
        }
    }
    info!("health loop stopped");
}

// ---------------------------------------------------------------------------
// Event forwarding
// ---------------------------------------------------------------------------

/// Fan drained interlock events out to the log and notification sinks.
pub async fn forward_pump_events(core: &Core, events: Vec<PumpEvent>) {
    if events.is_empty() {
        return;
    }
    let mut status = core.status.write().await;
    for event in events {
        match event {
            PumpEvent::Started { zone, duration } => {
                let msg = format!(
                    "watering started for zone {zone} (max {}s)",
                    duration.as_secs()
                );
                status.record(EventKind::Pump, msg.clone());
                core.notifier
                    .notify(&Alert::new(AlertKind::WateringStarted, msg));
            }
            PumpEvent::Stopped {
                zone,
                runtime,
                reason,
            } => {
                let msg = format!(
                    "watering stopped for zone {zone} after {}s ({reason})",
                    runtime.as_secs()
                );
                status.record(EventKind::Pump, msg.clone());
                core.notifier
                    .notify(&Alert::new(AlertKind::WateringStopped, msg));
            }
            PumpEvent::CooldownEnded { zone } => {
                status.record(EventKind::Pump, format!("cooldown ended for zone {zone}"));
            }
            PumpEvent::Faulted { reason } => {
                let msg = format!("pump interlock fault: {reason} — watering halted until reset");
                status.record(EventKind::Error, msg.clone());
                core.notifier.notify(&Alert::new(AlertKind::Fault, msg));
            }
            PumpEvent::Reset => {
                status.record(EventKind::System, "pump interlock reset".to_string());
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
