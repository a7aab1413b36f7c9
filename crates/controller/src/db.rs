//! Calibration persistence: a SQLite-backed store with an in-memory
//! snapshot that readers hit on every conversion. Commits write the row
//! first and swap the snapshot after, so a reader never observes a torn
//! or half-applied set of bounds.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::{info, warn};

use crate::gpio::Channel;

/// Minimum distance between the raw endpoints of usable bounds. Anything
/// tighter would make the normalization divide by a near-zero span.
pub const MIN_SPAN: i64 = 50;

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Percent,
}

impl Unit {
    pub fn as_str(self) -> &'static str {
        match self {
            Unit::Percent => "percent",
        }
    }
}

impl Serialize for Unit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self.as_str())
    }
}

/// Raw sensor values corresponding to 0% and 100% of the measured
/// quantity. `raw_low < raw_high` always holds for stored bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationBounds {
    pub channel: Channel,
    pub raw_low: i64,
    pub raw_high: i64,
    pub unit: Unit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundsError {
    NotCalibratable(Channel),
    Inverted,
    SpanTooSmall { span: i64 },
}

impl fmt::Display for BoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundsError::NotCalibratable(channel) => {
                write!(f, "channel {channel} does not take calibration")
            }
            BoundsError::Inverted => write!(f, "raw_low must be less than raw_high"),
            BoundsError::SpanTooSmall { span } => {
                write!(f, "calibration span {span} below minimum {MIN_SPAN}")
            }
        }
    }
}

impl std::error::Error for BoundsError {}

// ---------------------------------------------------------------------------
// Database wrapper
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:gartenbot.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            // Skip the pre-acquire liveness ping: for an in-process SQLite
            // pool it never detects a real fault, and the extra round-trip to
            // the driver's worker thread is what trips a spurious acquire
            // timeout when tests drive the pool under a paused tokio clock.
            .test_before_acquire(false)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    async fn upsert_bounds(&self, b: &CalibrationBounds) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO calibration (channel, raw_low, raw_high, unit)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(channel) DO UPDATE SET
              raw_low=excluded.raw_low,
              raw_high=excluded.raw_high,
              unit=excluded.unit
            "#,
        )
        .bind(b.channel.to_string())
        .bind(b.raw_low)
        .bind(b.raw_high)
        .bind(b.unit.as_str())
        .execute(&self.pool)
        .await
        .context("upsert_bounds failed")?;
        Ok(())
    }

    async fn load_bounds(&self) -> Result<Vec<CalibrationBounds>> {
        let rows = sqlx::query("SELECT channel, raw_low, raw_high, unit FROM calibration ORDER BY channel")
            .fetch_all(&self.pool)
            .await
            .context("load_bounds failed")?;

        let mut bounds = Vec::with_capacity(rows.len());
        for row in rows {
            let channel_str: String = row.try_get("channel").context("calibration.channel")?;
            let Ok(channel) = channel_str.parse::<Channel>() else {
                warn!(channel = %channel_str, "ignoring calibration row for unknown channel");
                continue;
            };
            bounds.push(CalibrationBounds {
                channel,
                raw_low: row.try_get("raw_low").context("calibration.raw_low")?,
                raw_high: row.try_get("raw_high").context("calibration.raw_high")?,
                unit: Unit::Percent,
            });
        }
        Ok(bounds)
    }
}

// ---------------------------------------------------------------------------
// Calibration store
// ---------------------------------------------------------------------------

/// Cloneable handle shared between the sensor reader (read side) and the
/// calibration wizard (write side).
#[derive(Clone)]
pub struct CalibrationStore {
    db: Db,
    bounds: Arc<RwLock<HashMap<Channel, CalibrationBounds>>>,
}

impl CalibrationStore {
    pub async fn load(db: Db) -> Result<Self> {
        let loaded = db.load_bounds().await?;
        info!(channels = loaded.len(), "calibration store loaded");
        let map = loaded.into_iter().map(|b| (b.channel, b)).collect();
        Ok(Self {
            db,
            bounds: Arc::new(RwLock::new(map)),
        })
    }

    pub fn bounds(&self, channel: Channel) -> Option<CalibrationBounds> {
        let map = self.bounds.read().unwrap_or_else(|p| p.into_inner());
        map.get(&channel).copied()
    }

    pub fn all(&self) -> Vec<CalibrationBounds> {
        let map = self.bounds.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<_> = map.values().copied().collect();
        all.sort_by_key(|b| b.channel);
        all
    }

    pub fn validate(b: &CalibrationBounds) -> Result<(), BoundsError> {
        if !b.channel.is_percentage() {
            return Err(BoundsError::NotCalibratable(b.channel));
        }
        if b.raw_low >= b.raw_high {
            return Err(BoundsError::Inverted);
        }
        let span = b.raw_high - b.raw_low;
        if span <= MIN_SPAN {
            return Err(BoundsError::SpanTooSmall { span });
        }
        Ok(())
    }

    /// Persist new bounds and publish them. The database write happens
    /// before the snapshot swap: until it completes, readers keep the
    /// previous bounds.
    pub async fn commit(&self, b: CalibrationBounds) -> Result<()> {
        Self::validate(&b)?;
        self.db.upsert_bounds(&b).await?;
        {
            let mut map = self.bounds.write().unwrap_or_else(|p| p.into_inner());
            map.insert(b.channel, b);
        }
        info!(
            channel = %b.channel,
            raw_low = b.raw_low,
            raw_high = b.raw_high,
            "calibration bounds committed"
        );
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
