//! Sunset oracle boundary. The actual sunset computation lives with an
//! external collaborator that pushes the flag in at its own cadence; the
//! core only asks "is it past sunset" and treats a stale or never-set
//! answer as no — do not water if unsure.

use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use tracing::info;

use crate::config::SharedSettings;

#[derive(Debug, Clone, Copy)]
struct SunsetSample {
    past_sunset: bool,
    refreshed: Instant,
}

pub struct SunsetOracle {
    cfg: SharedSettings,
    sample: Mutex<Option<SunsetSample>>,
}

impl SunsetOracle {
    pub fn new(cfg: SharedSettings) -> Self {
        Self {
            cfg,
            sample: Mutex::new(None),
        }
    }

    /// Called by the external refresher.
    pub fn set(&self, past_sunset: bool) {
        let mut sample = self.sample.lock().unwrap_or_else(|p| p.into_inner());
        *sample = Some(SunsetSample {
            past_sunset,
            refreshed: Instant::now(),
        });
        info!(past_sunset, "sunset flag refreshed");
    }

    pub fn is_past_sunset(&self) -> bool {
        let stale_after = Duration::from_secs(self.cfg.current().sunset_stale_after_s);
        let sample = self.sample.lock().unwrap_or_else(|p| p.into_inner());
        match *sample {
            Some(s) if s.refreshed.elapsed() <= stale_after => s.past_sunset,
            // Never refreshed, or the refresher went quiet: fail safe.
            _ => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn oracle() -> SunsetOracle {
        SunsetOracle::new(SharedSettings::new(Settings::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn unset_oracle_reads_false() {
        assert!(!oracle().is_past_sunset());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_flag_is_returned() {
        let oracle = oracle();
        oracle.set(true);
        assert!(oracle.is_past_sunset());
        oracle.set(false);
        assert!(!oracle.is_past_sunset());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_flag_fails_safe() {
        let oracle = oracle();
        oracle.set(true);
        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(!oracle.is_past_sunset());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_resets_staleness() {
        let oracle = oracle();
        oracle.set(true);
        tokio::time::advance(Duration::from_secs(3000)).await;
        oracle.set(true);
        tokio::time::advance(Duration::from_secs(3000)).await;
        assert!(oracle.is_past_sunset());
    }
}
