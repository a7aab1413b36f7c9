mod calib;
mod config;
mod db;
mod engine;
mod gpio;
mod notify;
mod pump;
mod scheduler;
mod sensor;
mod state;
mod sun;
mod web;

use std::{env, sync::Arc};

use anyhow::{Context, Result};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use calib::Calibrator;
use config::SharedSettings;
use db::{CalibrationStore, Db};
use gpio::Board;
use notify::{Alert, AlertKind, LogNotifier, MqttNotifier, Notifier};
use pump::PumpInterlock;
use scheduler::Core;
use sensor::SensorReader;
use state::{EventKind, SharedStatus, SystemStatus};
use sun::SunsetOracle;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = SharedSettings::new(config::load(&config_path)?);

    // ── Calibration store ───────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:gartenbot.db?mode=rwc".to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    let store = CalibrationStore::load(db).await?;
    if store.all().is_empty() {
        warn!("no calibration bounds stored — soil and level read invalid until calibrated");
    }

    // ── Board ───────────────────────────────────────────────────────
    let board = make_board()?;
    // Fail-safe: the output must be off before any logic runs.
    if let Err(e) = board.set_pump(false) {
        warn!("could not force pump off at startup: {e}");
    }

    // ── Core wiring ─────────────────────────────────────────────────
    let interlock = Arc::new(PumpInterlock::new(Arc::clone(&board), cfg.clone()));
    let reader = SensorReader::new(Arc::clone(&board), store.clone());
    let calibrator = Arc::new(Calibrator::new(Arc::clone(&board), store.clone()));
    let sunset = Arc::new(SunsetOracle::new(cfg.clone()));
    let status: SharedStatus = Arc::new(RwLock::new(SystemStatus::new()));
    let notifier = make_notifier();

    {
        let mut st = status.write().await;
        st.record(EventKind::System, "controller started".to_string());
    }
    notifier.notify(&Alert::new(AlertKind::System, "controller started"));

    let core = Core {
        cfg,
        store,
        reader,
        interlock,
        calibrator,
        sun: sunset,
        status,
        notifier: Arc::clone(&notifier),
    };

    // ── Control API ─────────────────────────────────────────────────
    let web_core = core.clone();
    tokio::spawn(async move {
        web::serve(web_core).await;
    });

    // ── Periodic activities ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let evaluation = tokio::spawn(scheduler::run_evaluation(core.clone(), shutdown_rx.clone()));
    let health = tokio::spawn(scheduler::run_health(core.clone(), shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    // ── Shutdown sweep ──────────────────────────────────────────────
    // Cancel the loops first, then force the pump off: leaving the output
    // energised past exit is the one failure this ordering must prevent.
    let _ = shutdown_tx.send(true);
    let _ = evaluation.await;
    let _ = health.await;

    core.interlock.force_off().await;
    scheduler::forward_pump_events(&core, core.interlock.drain_events().await).await;

    notifier.notify(&Alert::new(AlertKind::System, "controller stopped"));
    info!("shutdown complete");
    Ok(())
}

#[cfg(feature = "gpio")]
fn make_board() -> Result<Arc<dyn Board>> {
    let relay_pin: u8 = env::var("PUMP_RELAY_PIN")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(17);
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    Ok(Arc::new(gpio::RelayBoard::new(relay_pin, active_low)?))
}

#[cfg(not(feature = "gpio"))]
fn make_board() -> Result<Arc<dyn Board>> {
    info!("built without the gpio feature — using the simulated board");
    Ok(Arc::new(gpio::SimBoard::new()))
}

fn make_notifier() -> Arc<dyn Notifier> {
    match env::var("MQTT_HOST") {
        Ok(host) => {
            let port: u16 = env::var("MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883);
            info!(host = %host, port, "alerts via mqtt");
            Arc::new(MqttNotifier::connect(&host, port))
        }
        Err(_) => {
            info!("MQTT_HOST not set — alerts go to the log only");
            Arc::new(LogNotifier)
        }
    }
}
