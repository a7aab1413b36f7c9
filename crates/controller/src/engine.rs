//! Watering decision engine: one pass per evaluation tick over the gate
//! chain (sunset, temperature, water level, then the fixed zone order).
//! Every gate is re-evaluated from scratch each tick — there is no sticky
//! skip state. The engine issues at most one accepted pump request per
//! tick; the interlock owns everything after that.

use std::fmt;

use serde::{Serialize, Serializer};
use time::OffsetDateTime;
use tokio::time::{Duration, Instant};

use crate::config::Settings;
use crate::gpio::ZoneId;
use crate::pump::{PumpInterlock, PumpState, RejectReason, RequestOutcome};
use crate::sensor::Snapshot;

// ---------------------------------------------------------------------------
// Outcome record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SensorInvalid,
    NotDry,
    PumpBusy,
    CooldownActive,
    PumpFault,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::SensorInvalid => write!(f, "sensor invalid"),
            SkipReason::NotDry => write!(f, "not dry"),
            SkipReason::PumpBusy => write!(f, "pump busy"),
            SkipReason::CooldownActive => write!(f, "cooldown active"),
            SkipReason::PumpFault => write!(f, "pump fault"),
        }
    }
}

impl Serialize for SkipReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<RejectReason> for SkipReason {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::PumpBusy => SkipReason::PumpBusy,
            RejectReason::CooldownActive => SkipReason::CooldownActive,
            RejectReason::Faulted => SkipReason::PumpFault,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneAction {
    Water,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ZoneDecision {
    pub zone: ZoneId,
    pub dry: bool,
    pub cooldown_ok: bool,
    pub action: ZoneAction,
}

/// Write-once record of one evaluation tick, forwarded to the log sink.
/// The global flags are filled in every tick; zone decisions only exist
/// when the per-zone scan actually ran (the flags say why it didn't).
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub past_sunset: bool,
    pub temperature_ok: bool,
    pub water_level_ok: bool,
    pub zones: Vec<ZoneDecision>,
    pub watered: Option<ZoneId>,
}

impl DecisionOutcome {
    pub fn summary(&self) -> String {
        if !self.past_sunset {
            "waiting for sunset".to_string()
        } else if !self.temperature_ok {
            "overheat — watering suppressed".to_string()
        } else if !self.water_level_ok {
            "water level low — watering suppressed".to_string()
        } else if let Some(zone) = self.watered {
            format!("watering zone {zone}")
        } else {
            "no zone watered this tick".to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Run one tick. Gate order, short-circuiting:
/// 1. not past sunset → nothing happens
/// 2. temperature invalid or at/above the overheat limit → nothing
/// 3. level invalid or below the minimum → nothing
/// 4. zones in fixed order 1→4; the first accepted request ends the scan
///    (single shared pump), rejections skip just that zone.
pub async fn evaluate(
    snapshot: &Snapshot,
    past_sunset: bool,
    interlock: &PumpInterlock,
    cfg: &Settings,
) -> DecisionOutcome {
    let temperature_ok = snapshot
        .temperature
        .value()
        .is_some_and(|t| t < cfg.overheat_threshold);
    let water_level_ok = snapshot
        .level
        .value()
        .is_some_and(|l| l >= cfg.min_level_threshold);

    let mut outcome = DecisionOutcome {
        at: OffsetDateTime::now_utc(),
        past_sunset,
        temperature_ok,
        water_level_ok,
        zones: Vec::new(),
        watered: None,
    };

    if !past_sunset || !temperature_ok || !water_level_ok {
        return outcome;
    }

    let zones_meta = interlock.zones().await;
    let cooldown = Duration::from_secs(cfg.cooldown_s);
    let now = Instant::now();
    // Re-evaluating while a run is in progress must not issue another
    // request; record the state once instead of collecting four
    // busy-rejections.
    let already_running = matches!(interlock.state().await, PumpState::Running { .. });

    for zone in ZoneId::ALL {
        let reading = snapshot.soil(zone);
        let cooldown_ok = zones_meta[zone.index()]
            .last_watered
            .map_or(true, |t| now.duration_since(t) >= cooldown);

        let (dry, action) = match reading.value() {
            None => (false, ZoneAction::Skip(SkipReason::SensorInvalid)),
            Some(moisture) if moisture >= cfg.dry_threshold => {
                (false, ZoneAction::Skip(SkipReason::NotDry))
            }
            Some(_) if already_running || outcome.watered.is_some() => {
                (true, ZoneAction::Skip(SkipReason::PumpBusy))
            }
            Some(_) => {
                match interlock
                    .request(zone, Duration::from_secs(cfg.max_runtime_s))
                    .await
                {
                    RequestOutcome::Accepted { .. } => {
                        outcome.watered = Some(zone);
                        (true, ZoneAction::Water)
                    }
                    RequestOutcome::Rejected(reason) => {
                        (true, ZoneAction::Skip(reason.into()))
                    }
                }
            }
        };

        outcome.zones.push(ZoneDecision {
            zone,
            dry,
            cooldown_ok,
            action,
        });
    }

    outcome
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::SharedSettings;
    use crate::gpio::{Board, Channel, MockBoard};
    use crate::pump::StopReason;
    use crate::sensor::{Reading, ReadingFault, Sample};

    fn z(n: u8) -> ZoneId {
        ZoneId::new(n).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn valid(channel: Channel, value: f64) -> Reading {
        Reading {
            channel,
            taken_at: OffsetDateTime::now_utc(),
            sample: Ok(Sample {
                raw: value as i64,
                value,
            }),
        }
    }

    fn invalid(channel: Channel) -> Reading {
        Reading {
            channel,
            taken_at: OffsetDateTime::now_utc(),
            sample: Err(ReadingFault::Uncalibrated),
        }
    }

    /// A benign snapshot: everything moist, half tank, 25 °C.
    fn snapshot() -> Snapshot {
        Snapshot {
            taken_at: OffsetDateTime::now_utc(),
            soil: ZoneId::ALL.map(|zone| valid(Channel::Soil(zone), 60.0)),
            level: valid(Channel::Level, 50.0),
            temperature: valid(Channel::BoardTemp, 25.0),
        }
    }

    fn set_soil(snapshot: &mut Snapshot, zone: ZoneId, moisture: f64) {
        snapshot.soil[zone.index()] = valid(Channel::Soil(zone), moisture);
    }

    fn test_interlock() -> (Arc<PumpInterlock>, Arc<MockBoard>) {
        let board = Arc::new(MockBoard::new());
        let cfg = SharedSettings::new(Settings::default());
        let interlock = Arc::new(PumpInterlock::new(
            Arc::clone(&board) as Arc<dyn Board>,
            cfg,
        ));
        (interlock, board)
    }

    // -- gate 1: sunset -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn before_sunset_nothing_happens() {
        let (interlock, board) = test_interlock();
        let mut snap = snapshot();
        set_soil(&mut snap, z(1), 10.0); // bone dry, but it's daytime

        let outcome = evaluate(&snap, false, &interlock, &Settings::default()).await;

        assert!(!outcome.past_sunset);
        assert!(outcome.zones.is_empty());
        assert_eq!(outcome.watered, None);
        assert!(!board.pump_on());
        assert_eq!(outcome.summary(), "waiting for sunset");
    }

    // -- gate 2: temperature --------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn invalid_temperature_suppresses_watering() {
        let (interlock, board) = test_interlock();
        let mut snap = snapshot();
        snap.temperature = invalid(Channel::BoardTemp);
        set_soil(&mut snap, z(1), 10.0);

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;

        assert!(!outcome.temperature_ok);
        assert_eq!(outcome.watered, None);
        assert!(!board.pump_on());
    }

    #[tokio::test(start_paused = true)]
    async fn overheat_suppresses_watering() {
        let (interlock, board) = test_interlock();
        let mut snap = snapshot();
        snap.temperature = valid(Channel::BoardTemp, 75.0);
        set_soil(&mut snap, z(1), 10.0);

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;

        assert!(!outcome.temperature_ok);
        assert_eq!(outcome.watered, None);
        assert!(!board.pump_on());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sunset_and_bad_temperature_combined() {
        let (interlock, board) = test_interlock();
        let mut snap = snapshot();
        snap.temperature = invalid(Channel::BoardTemp);
        set_soil(&mut snap, z(1), 10.0);

        let outcome = evaluate(&snap, false, &interlock, &Settings::default()).await;

        assert!(!outcome.past_sunset);
        assert!(!outcome.temperature_ok);
        assert_eq!(outcome.watered, None);
        assert!(!board.pump_on());
    }

    // -- gate 3: water level --------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn low_water_level_suppresses_watering() {
        let (interlock, board) = test_interlock();
        let mut snap = snapshot();
        snap.level = valid(Channel::Level, 10.0); // below the 15% minimum
        for zone in ZoneId::ALL {
            set_soil(&mut snap, zone, 10.0); // every zone dry
        }

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;

        assert!(!outcome.water_level_ok);
        assert_eq!(outcome.watered, None);
        assert!(!board.pump_on());
        assert!(matches!(interlock.state().await, PumpState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_level_reading_suppresses_watering() {
        let (interlock, _) = test_interlock();
        let mut snap = snapshot();
        snap.level = invalid(Channel::Level);
        set_soil(&mut snap, z(1), 10.0);

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;
        assert!(!outcome.water_level_ok);
        assert_eq!(outcome.watered, None);
    }

    // -- gate 4: zone scan ----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dry_zone_gets_watered() {
        let (interlock, board) = test_interlock();
        let mut snap = snapshot();
        set_soil(&mut snap, z(2), 20.0); // < 30% threshold

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;

        assert_eq!(outcome.watered, Some(z(2)));
        assert!(board.pump_on());
        assert!(matches!(
            interlock.state().await,
            PumpState::Running { zone, .. } if zone == z(2)
        ));
        let d = &outcome.zones[z(2).index()];
        assert!(d.dry);
        assert!(d.cooldown_ok);
        assert_eq!(d.action, ZoneAction::Water);
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_zone_wins_when_several_are_dry() {
        let (interlock, _) = test_interlock();
        let mut snap = snapshot();
        set_soil(&mut snap, z(1), 10.0);
        set_soil(&mut snap, z(3), 10.0);

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;

        assert_eq!(outcome.watered, Some(z(1)));
        assert_eq!(outcome.zones[z(1).index()].action, ZoneAction::Water);
        // Zone 3 waits for a later tick.
        assert_eq!(
            outcome.zones[z(3).index()].action,
            ZoneAction::Skip(SkipReason::PumpBusy)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn moist_zones_skip_not_dry() {
        let (interlock, _) = test_interlock();
        let snap = snapshot();

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;

        assert_eq!(outcome.watered, None);
        for d in &outcome.zones {
            assert!(!d.dry);
            assert_eq!(d.action, ZoneAction::Skip(SkipReason::NotDry));
        }
        assert_eq!(outcome.summary(), "no zone watered this tick");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_soil_sensor_skips_only_that_zone() {
        let (interlock, _) = test_interlock();
        let mut snap = snapshot();
        snap.soil[z(1).index()] = invalid(Channel::Soil(z(1)));
        set_soil(&mut snap, z(2), 10.0);

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;

        assert_eq!(
            outcome.zones[z(1).index()].action,
            ZoneAction::Skip(SkipReason::SensorInvalid)
        );
        // The bad sensor did not abort evaluation of the other zones.
        assert_eq!(outcome.watered, Some(z(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn running_pump_means_no_second_request() {
        let (interlock, _) = test_interlock();
        let mut snap = snapshot();
        set_soil(&mut snap, z(1), 10.0);

        let first = evaluate(&snap, true, &interlock, &Settings::default()).await;
        assert_eq!(first.watered, Some(z(1)));
        let started_events = interlock.drain_events().await.len();

        // Unchanged snapshot, pump still running: every zone skips, no
        // request is issued, no new events appear.
        let second = evaluate(&snap, true, &interlock, &Settings::default()).await;
        assert_eq!(second.watered, None);
        assert_eq!(
            second.zones[z(1).index()].action,
            ZoneAction::Skip(SkipReason::PumpBusy)
        );
        assert_eq!(started_events, 1);
        assert!(interlock.drain_events().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zone_in_cooldown_is_skipped_and_scan_continues() {
        let board = Arc::new(MockBoard::new());
        let shared = SharedSettings::new(Settings::default());
        let interlock = PumpInterlock::new(Arc::clone(&board) as Arc<dyn Board>, shared.clone());

        // Water zone 1, stop it, let the pump-wide cooldown lapse, then
        // stretch the cooldown so zone 1's own window is still open.
        interlock.request(z(1), secs(180)).await;
        interlock.stop(StopReason::Engine).await;
        tokio::time::advance(secs(301)).await;
        interlock.tick().await;

        let mut cfg = Settings::default();
        cfg.cooldown_s = 900;
        shared.apply(cfg.clone()).unwrap();

        let mut snap = snapshot();
        set_soil(&mut snap, z(1), 10.0);
        set_soil(&mut snap, z(4), 10.0);

        let outcome = evaluate(&snap, true, &interlock, &cfg).await;

        let d1 = &outcome.zones[z(1).index()];
        assert!(!d1.cooldown_ok);
        assert_eq!(d1.action, ZoneAction::Skip(SkipReason::CooldownActive));
        // Another eligible zone still gets the pump this tick.
        assert_eq!(outcome.watered, Some(z(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn faulted_interlock_records_pump_fault_skips() {
        let (interlock, board) = test_interlock();
        board.fail_pump(true);
        // Latch the fault.
        interlock.request(z(1), secs(180)).await;

        let mut snap = snapshot();
        set_soil(&mut snap, z(2), 10.0);

        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;
        assert_eq!(outcome.watered, None);
        assert_eq!(
            outcome.zones[z(2).index()].action,
            ZoneAction::Skip(SkipReason::PumpFault)
        );
    }

    // -- serialization --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn outcome_serializes_with_readable_reasons() {
        let (interlock, _) = test_interlock();
        let snap = snapshot();
        let outcome = evaluate(&snap, true, &interlock, &Settings::default()).await;

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["past_sunset"], true);
        assert_eq!(json["zones"][0]["action"]["skip"], "not dry");
    }
}
