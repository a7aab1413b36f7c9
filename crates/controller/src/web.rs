//! HTTP control surface: status snapshot plus the handful of operator
//! hooks the core needs from the outside world (config updates, sunset
//! refresh, pump stop/reset, calibration wizard). No command language,
//! no users — richer remote control belongs to an external collaborator.

use std::env;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::calib::{CaptureOutcome, SessionView, WizardError};
use crate::config::Settings;
use crate::db::CalibrationBounds;
use crate::engine::DecisionOutcome;
use crate::gpio::Channel;
use crate::pump::{PumpView, StopReason, ZoneView};
use crate::scheduler::{forward_pump_events, Core};
use crate::sensor::ReadingView;
use crate::state::{EventKind, SystemEvent};

#[derive(Clone)]
struct AppState {
    core: Core,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(core: Core) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/sunset", put(put_sunset))
        .route("/api/pump/stop", post(pump_stop))
        .route("/api/pump/reset", post(pump_reset))
        .route("/api/calibration/{channel}/start", post(cal_start))
        .route("/api/calibration/{channel}/sample", post(cal_sample))
        .route("/api/calibration/{channel}/abort", post(cal_abort))
        .with_state(AppState { core })
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    uptime_secs: u64,
    ticks: u64,
    past_sunset: bool,
    pump: PumpView,
    zones: Vec<ZoneView>,
    readings: Vec<ReadingView>,
    calibration: Vec<CalibrationBounds>,
    calibration_sessions: Vec<SessionView>,
    last_outcome: Option<DecisionOutcome>,
    events: Vec<SystemEvent>,
}

async fn status(State(app): State<AppState>) -> Json<StatusResponse> {
    let snapshot = app.core.reader.snapshot();
    let st = app.core.status.read().await;
    Json(StatusResponse {
        uptime_secs: st.uptime_secs(),
        ticks: st.ticks,
        past_sunset: app.core.sun.is_past_sunset(),
        pump: app.core.interlock.view().await,
        zones: app.core.interlock.zone_views().await,
        readings: snapshot.views(),
        calibration: app.core.store.all(),
        calibration_sessions: app.core.calibrator.active().await,
        last_outcome: st.last_outcome.clone(),
        events: st.events_newest_first(),
    })
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn get_config(State(app): State<AppState>) -> Json<Settings> {
    Json(app.core.cfg.current())
}

async fn put_config(State(app): State<AppState>, Json(new): Json<Settings>) -> Response {
    match app.core.cfg.apply(new) {
        Ok(()) => {
            app.core
                .status
                .write()
                .await
                .record(EventKind::Config, "configuration updated".to_string());
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": format!("{e:#}") })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Sunset refresh
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SunsetUpdate {
    past_sunset: bool,
}

async fn put_sunset(State(app): State<AppState>, Json(update): Json<SunsetUpdate>) -> StatusCode {
    app.core.sun.set(update.past_sunset);
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

async fn pump_stop(State(app): State<AppState>) -> Json<Value> {
    let stopped = app.core.interlock.stop(StopReason::Operator).await;
    forward_pump_events(&app.core, app.core.interlock.drain_events().await).await;
    Json(json!({ "stopped": stopped }))
}

async fn pump_reset(State(app): State<AppState>) -> Response {
    let result = app.core.interlock.reset().await;
    forward_pump_events(&app.core, app.core.interlock.drain_events().await).await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Calibration wizard
// ---------------------------------------------------------------------------

fn parse_channel(raw: &str) -> Result<Channel, Response> {
    raw.parse().map_err(|()| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown channel '{raw}'") })),
        )
            .into_response()
    })
}

fn wizard_error(e: WizardError) -> Response {
    let code = match &e {
        WizardError::NotCalibratable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WizardError::NoSession(_) => StatusCode::CONFLICT,
        WizardError::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(json!({ "error": e.to_string() }))).into_response()
}

async fn cal_start(State(app): State<AppState>, Path(channel): Path<String>) -> Response {
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match app.core.calibrator.start(channel).await {
        Ok(()) => {
            app.core.status.write().await.record(
                EventKind::Calibration,
                format!("calibration session started for {channel}"),
            );
            Json(json!({ "stage": "awaiting dry sample" })).into_response()
        }
        Err(e) => wizard_error(e),
    }
}

async fn cal_sample(State(app): State<AppState>, Path(channel): Path<String>) -> Response {
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match app.core.calibrator.sample(channel).await {
        Ok(CaptureOutcome::DrySampled { avg }) => Json(json!({
            "stage": "awaiting wet sample",
            "dry_avg": avg,
        }))
        .into_response(),
        Ok(CaptureOutcome::Committed { bounds }) => {
            app.core.status.write().await.record(
                EventKind::Calibration,
                format!(
                    "calibration committed for {channel} ({}..{})",
                    bounds.raw_low, bounds.raw_high
                ),
            );
            Json(json!({ "committed": bounds })).into_response()
        }
        Ok(CaptureOutcome::Aborted { reason }) => {
            app.core.status.write().await.record(
                EventKind::Calibration,
                format!("calibration aborted for {channel}: {reason}"),
            );
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "aborted": reason.to_string() })),
            )
                .into_response()
        }
        Err(e) => wizard_error(e),
    }
}

async fn cal_abort(State(app): State<AppState>, Path(channel): Path<String>) -> Response {
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match app.core.calibrator.abort(channel).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => wizard_error(e),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(core: Core) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!("control api listening on http://{addr}");

    axum::serve(listener, router(core))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================
