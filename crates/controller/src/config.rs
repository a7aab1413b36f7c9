//! TOML config loading, validation, and the shared hot-updatable settings
//! handle. Thresholds are re-read every tick, so an applied update takes
//! effect without a restart; an invalid update is rejected wholesale and
//! the previous configuration stays authoritative.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Soil moisture below this percentage counts as dry.
    pub dry_threshold: f64,
    /// Tank level below this percentage suppresses watering.
    pub min_level_threshold: f64,
    /// Board temperature at or above this suppresses watering (°C).
    pub overheat_threshold: f64,
    /// Hard cap on a single pump run (seconds).
    pub max_runtime_s: u64,
    /// Mandatory idle period after a run (seconds).
    pub cooldown_s: u64,
    /// Decision engine cadence (seconds).
    pub eval_interval_s: u64,
    /// Safety loop cadence (seconds); must be faster than the evaluation
    /// interval so the runtime cutoff never waits on a slow tick.
    pub health_interval_s: u64,
    /// A sunset flag older than this reads as "not past sunset".
    pub sunset_stale_after_s: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dry_threshold: 30.0,
            min_level_threshold: 15.0,
            overheat_threshold: 70.0,
            max_runtime_s: 180,
            cooldown_s: 300,
            eval_interval_s: 300,
            health_interval_s: 5,
            sunset_stale_after_s: 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all fields. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !(0.0..=100.0).contains(&self.dry_threshold) {
            errors.push(format!(
                "dry_threshold {} out of range [0, 100]",
                self.dry_threshold
            ));
        }
        if !(0.0..=100.0).contains(&self.min_level_threshold) {
            errors.push(format!(
                "min_level_threshold {} out of range [0, 100]",
                self.min_level_threshold
            ));
        }
        if !(40.0..=90.0).contains(&self.overheat_threshold) {
            errors.push(format!(
                "overheat_threshold {} out of range [40, 90]",
                self.overheat_threshold
            ));
        }
        if !(10..=600).contains(&self.max_runtime_s) {
            errors.push(format!(
                "max_runtime_s {} out of range [10, 600]",
                self.max_runtime_s
            ));
        }
        if !(30..=3600).contains(&self.cooldown_s) {
            errors.push(format!(
                "cooldown_s {} out of range [30, 3600]",
                self.cooldown_s
            ));
        }
        if !(10..=3600).contains(&self.eval_interval_s) {
            errors.push(format!(
                "eval_interval_s {} out of range [10, 3600]",
                self.eval_interval_s
            ));
        }
        if !(1..=60).contains(&self.health_interval_s) {
            errors.push(format!(
                "health_interval_s {} out of range [1, 60]",
                self.health_interval_s
            ));
        }
        if self.health_interval_s >= self.eval_interval_s {
            errors.push(format!(
                "health_interval_s ({}) must be less than eval_interval_s ({})",
                self.health_interval_s, self.eval_interval_s
            ));
        }
        if !(60..=86_400).contains(&self.sunset_stale_after_s) {
            errors.push(format!(
                "sunset_stale_after_s {} out of range [60, 86400]",
                self.sunset_stale_after_s
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// built-in defaults so a bare checkout still runs.
pub fn load(path: &str) -> Result<Settings> {
    if !Path::new(path).exists() {
        info!(path, "no config file — using built-in defaults");
        return Ok(Settings::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    settings
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(settings)
}

// ---------------------------------------------------------------------------
// Shared handle with hot update
// ---------------------------------------------------------------------------

/// Cloneable handle to the live settings. Readers take a full copy per
/// tick; updates swap the whole struct so no tick ever sees a half-applied
/// configuration.
#[derive(Clone)]
pub struct SharedSettings {
    tx: Arc<watch::Sender<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(settings);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Validate and apply an update; on failure the previous valid
    /// configuration is retained.
    pub fn apply(&self, new: Settings) -> Result<()> {
        new.validate().context("config update rejected")?;
        self.tx.send_replace(new);
        info!("configuration updated");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
