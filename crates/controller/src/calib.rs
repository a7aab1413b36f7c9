//! Guided sensor calibration: per-channel sessions that average a handful
//! of raw samples at the dry and wet ends (empty/full for the level
//! channel), validate the separation, and commit new bounds through the
//! store. No partial bounds are ever published; an abandoned session is
//! reaped by the scheduler's timeout sweep.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::db::{CalibrationBounds, CalibrationStore, Unit, MIN_SPAN};
use crate::gpio::{Board, Channel, IoError};

/// Raw samples averaged per stage.
pub const SAMPLES_PER_STAGE: usize = 5;
/// Spacing between the samples of one capture.
const SAMPLE_SPACING: Duration = Duration::from_millis(200);
/// A session idle longer than this is aborted by the sweep.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    AwaitingDry,
    AwaitingWet { dry_raw: f64 },
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::AwaitingDry => "awaiting dry sample",
            Stage::AwaitingWet { .. } => "awaiting wet sample",
        }
    }
}

#[derive(Debug)]
struct Session {
    stage: Stage,
    last_activity: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            stage: Stage::AwaitingDry,
            last_activity: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub channel: Channel,
    pub stage: &'static str,
    pub idle_secs: u64,
}

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// Dry end recorded; the session now awaits the wet sample.
    DrySampled { avg: f64 },
    /// Both ends recorded, separation sufficient, bounds committed.
    Committed { bounds: CalibrationBounds },
    /// Session ended without publishing anything.
    Aborted { reason: AbortReason },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    InsufficientSeparation { span: i64 },
    StoreWrite(String),
    Timeout,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::InsufficientSeparation { span } => {
                write!(f, "insufficient signal separation ({span} raw counts)")
            }
            AbortReason::StoreWrite(e) => write!(f, "store write failed: {e}"),
            AbortReason::Timeout => write!(f, "session timed out"),
        }
    }
}

#[derive(Debug)]
pub enum WizardError {
    NotCalibratable(Channel),
    NoSession(Channel),
    Io(IoError),
}

impl fmt::Display for WizardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WizardError::NotCalibratable(channel) => {
                write!(f, "channel {channel} does not take calibration")
            }
            WizardError::NoSession(channel) => {
                write!(f, "no calibration session active for {channel}")
            }
            WizardError::Io(e) => write!(f, "sampling failed: {e}"),
        }
    }
}

impl std::error::Error for WizardError {}

// ---------------------------------------------------------------------------
// Calibrator
// ---------------------------------------------------------------------------

pub struct Calibrator {
    board: Arc<dyn Board>,
    store: CalibrationStore,
    sessions: Mutex<HashMap<Channel, Session>>,
}

impl Calibrator {
    pub fn new(board: Arc<dyn Board>, store: CalibrationStore) -> Self {
        Self {
            board,
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a session for a channel. A session already in progress for
    /// the same channel is aborted and replaced.
    pub async fn start(&self, channel: Channel) -> Result<(), WizardError> {
        if !channel.is_percentage() {
            return Err(WizardError::NotCalibratable(channel));
        }
        let mut sessions = self.sessions.lock().await;
        if sessions.insert(channel, Session::new()).is_some() {
            info!(channel = %channel, "previous calibration session aborted by restart");
        } else {
            info!(channel = %channel, "calibration session started");
        }
        Ok(())
    }

    /// Capture the next stage's sample set. The sampling itself runs
    /// without the session lock so other channels' sessions are never
    /// held up.
    pub async fn sample(&self, channel: Channel) -> Result<CaptureOutcome, WizardError> {
        {
            let sessions = self.sessions.lock().await;
            if !sessions.contains_key(&channel) {
                return Err(WizardError::NoSession(channel));
            }
        }

        // An I/O failure leaves the session where it was; the operator can
        // retry and the timeout sweep will eventually reap a dead sensor.
        let avg = self.capture_average(channel).await.map_err(WizardError::Io)?;

        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&channel) else {
            // Restarted or aborted while we were sampling.
            return Err(WizardError::NoSession(channel));
        };
        session.last_activity = Instant::now();

        match session.stage {
            Stage::AwaitingDry => {
                session.stage = Stage::AwaitingWet { dry_raw: avg };
                info!(channel = %channel, avg = format!("{avg:.1}"), "dry sample recorded");
                Ok(CaptureOutcome::DrySampled { avg })
            }
            Stage::AwaitingWet { dry_raw } => {
                // Terminal either way: commit or abort, never partial.
                sessions.remove(&channel);

                let raw_low = dry_raw.min(avg).round() as i64;
                let raw_high = dry_raw.max(avg).round() as i64;
                let span = raw_high - raw_low;
                if span <= MIN_SPAN {
                    warn!(channel = %channel, span, "calibration aborted: endpoints too close");
                    return Ok(CaptureOutcome::Aborted {
                        reason: AbortReason::InsufficientSeparation { span },
                    });
                }

                let bounds = CalibrationBounds {
                    channel,
                    raw_low,
                    raw_high,
                    unit: Unit::Percent,
                };
                match self.store.commit(bounds).await {
                    Ok(()) => Ok(CaptureOutcome::Committed { bounds }),
                    Err(e) => {
                        warn!(channel = %channel, "calibration aborted: {e}");
                        Ok(CaptureOutcome::Aborted {
                            reason: AbortReason::StoreWrite(e.to_string()),
                        })
                    }
                }
            }
        }
    }

    /// Operator abort. Returns an error when no session exists.
    pub async fn abort(&self, channel: Channel) -> Result<(), WizardError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(&channel).is_none() {
            return Err(WizardError::NoSession(channel));
        }
        info!(channel = %channel, "calibration session aborted");
        Ok(())
    }

    /// Reap sessions idle past the timeout. Called from the health loop.
    pub async fn sweep_timeouts(&self) -> Vec<Channel> {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<Channel> = sessions
            .iter()
            .filter(|(_, s)| s.last_activity.elapsed() >= SESSION_TIMEOUT)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in &expired {
            sessions.remove(channel);
            warn!(channel = %channel, "calibration session timed out");
        }
        expired
    }

    pub async fn active(&self) -> Vec<SessionView> {
        let sessions = self.sessions.lock().await;
        let mut views: Vec<_> = sessions
            .iter()
            .map(|(channel, s)| SessionView {
                channel: *channel,
                stage: s.stage.name(),
                idle_secs: s.last_activity.elapsed().as_secs(),
            })
            .collect();
        views.sort_by_key(|v| v.channel);
        views
    }

    async fn capture_average(&self, channel: Channel) -> Result<f64, IoError> {
        let mut sum: i64 = 0;
        for i in 0..SAMPLES_PER_STAGE {
            if i > 0 {
                sleep(SAMPLE_SPACING).await;
            }
            sum += self.board.read_raw(channel)?;
        }
        Ok(sum as f64 / SAMPLES_PER_STAGE as f64)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::gpio::{MockBoard, ZoneId};

    fn soil(n: u8) -> Channel {
        Channel::Soil(ZoneId::new(n).unwrap())
    }

    async fn test_calibrator() -> (Calibrator, Arc<MockBoard>, CalibrationStore) {
        let board = Arc::new(MockBoard::new());
        // SQLite connects on a dedicated worker thread. Under `start_paused`
        // the tokio clock auto-advances past the pool's acquire timeout while
        // that thread is still working, spuriously failing every query. Run
        // the DB setup on the real clock, then re-pause for the timed logic.
        tokio::time::resume();
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let store = CalibrationStore::load(db).await.unwrap();
        tokio::time::pause();
        let calibrator = Calibrator::new(Arc::clone(&board) as Arc<dyn Board>, store.clone());
        (calibrator, board, store)
    }

    // -- happy path ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dry_then_wet_commits_ordered_bounds() {
        let (cal, board, store) = test_calibrator().await;
        cal.start(soil(1)).await.unwrap();

        board.set_value(soil(1), 200);
        assert_eq!(
            cal.sample(soil(1)).await.unwrap(),
            CaptureOutcome::DrySampled { avg: 200.0 }
        );

        board.set_value(soil(1), 800);
        let outcome = cal.sample(soil(1)).await.unwrap();
        let CaptureOutcome::Committed { bounds } = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert_eq!((bounds.raw_low, bounds.raw_high), (200, 800));

        // Session is gone and the store sees the new bounds.
        assert!(cal.active().await.is_empty());
        assert_eq!(store.bounds(soil(1)).unwrap().raw_low, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn inverted_endpoints_are_sorted_into_bounds() {
        // Capacitive sensors read high when dry; the wizard orders the
        // endpoints, it does not trust the operator's sequence.
        let (cal, board, store) = test_calibrator().await;
        cal.start(Channel::Level).await.unwrap();

        board.set_value(Channel::Level, 900);
        cal.sample(Channel::Level).await.unwrap();
        board.set_value(Channel::Level, 100);
        let outcome = cal.sample(Channel::Level).await.unwrap();

        assert!(matches!(outcome, CaptureOutcome::Committed { .. }));
        let b = store.bounds(Channel::Level).unwrap();
        assert_eq!((b.raw_low, b.raw_high), (100, 900));
    }

    // -- separation ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn insufficient_separation_aborts_and_keeps_old_bounds() {
        let (cal, board, store) = test_calibrator().await;
        store
            .commit(CalibrationBounds {
                channel: soil(2),
                raw_low: 200,
                raw_high: 800,
                unit: Unit::Percent,
            })
            .await
            .unwrap();

        cal.start(soil(2)).await.unwrap();
        board.set_value(soil(2), 500);
        cal.sample(soil(2)).await.unwrap();
        board.set_value(soil(2), 520);
        let outcome = cal.sample(soil(2)).await.unwrap();

        assert_eq!(
            outcome,
            CaptureOutcome::Aborted {
                reason: AbortReason::InsufficientSeparation { span: 20 }
            }
        );
        // Previous bounds remain authoritative.
        let b = store.bounds(soil(2)).unwrap();
        assert_eq!((b.raw_low, b.raw_high), (200, 800));
        assert!(cal.active().await.is_empty());
    }

    // -- exclusivity ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn restart_aborts_prior_session() {
        let (cal, board, _) = test_calibrator().await;
        cal.start(soil(1)).await.unwrap();
        board.set_value(soil(1), 200);
        cal.sample(soil(1)).await.unwrap();

        // Starting over puts the channel back at the dry stage.
        cal.start(soil(1)).await.unwrap();
        let views = cal.active().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].stage, "awaiting dry sample");
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_independent_per_channel() {
        let (cal, board, _) = test_calibrator().await;
        cal.start(soil(1)).await.unwrap();
        cal.start(soil(2)).await.unwrap();

        board.set_value(soil(1), 200);
        cal.sample(soil(1)).await.unwrap();

        let views = cal.active().await;
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].stage, "awaiting wet sample");
        assert_eq!(views[1].stage, "awaiting dry sample");
    }

    // -- guards ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn temperature_channel_is_not_calibratable() {
        let (cal, _, _) = test_calibrator().await;
        assert!(matches!(
            cal.start(Channel::BoardTemp).await,
            Err(WizardError::NotCalibratable(Channel::BoardTemp))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sample_without_session_is_an_error() {
        let (cal, _, _) = test_calibrator().await;
        assert!(matches!(
            cal.sample(soil(1)).await,
            Err(WizardError::NoSession(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn io_failure_keeps_session_alive() {
        let (cal, board, _) = test_calibrator().await;
        cal.start(soil(1)).await.unwrap();
        board.fail_read(soil(1));

        assert!(matches!(
            cal.sample(soil(1)).await,
            Err(WizardError::Io(_))
        ));
        // Session survives for a retry.
        let views = cal.active().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].stage, "awaiting dry sample");
    }

    // -- timeout --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_reaped_by_sweep() {
        let (cal, _, _) = test_calibrator().await;
        cal.start(soil(3)).await.unwrap();

        tokio::time::advance(SESSION_TIMEOUT + Duration::from_secs(1)).await;
        let expired = cal.sweep_timeouts().await;
        assert_eq!(expired, vec![soil(3)]);
        assert!(cal.active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_survives_sweep() {
        let (cal, board, _) = test_calibrator().await;
        cal.start(soil(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        board.set_value(soil(1), 200);
        cal.sample(soil(1)).await.unwrap(); // refreshes last_activity

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(cal.sweep_timeouts().await.is_empty());
        assert_eq!(cal.active().await.len(), 1);
    }
}
