//! Notification sink: categorized alerts, best-effort and fire-and-forget.
//! With a broker configured, alerts go out as JSON on
//! `gartenbot/alert/<category>`; otherwise they only hit the log. A sink
//! failure never propagates into the watering logic.

use std::fmt;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Overheat,
    LowWater,
    Fault,
    WateringStarted,
    WateringStopped,
    System,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Overheat => "overheat",
            AlertKind::LowWater => "low_water",
            AlertKind::Fault => "fault",
            AlertKind::WateringStarted => "watering_started",
            AlertKind::WateringStopped => "watering_stopped",
            AlertKind::System => "system",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: OffsetDateTime::now_utc(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

// ---------------------------------------------------------------------------
// Log-only notifier
// ---------------------------------------------------------------------------

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: &Alert) {
        match alert.kind {
            AlertKind::Fault | AlertKind::Overheat | AlertKind::LowWater => {
                warn!(kind = %alert.kind, "{}", alert.message);
            }
            _ => info!(kind = %alert.kind, "{}", alert.message),
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT notifier
// ---------------------------------------------------------------------------

pub struct MqttNotifier {
    client: AsyncClient,
}

impl MqttNotifier {
    /// The event loop runs in a spawned task to keep the connection alive;
    /// publishes go through the non-blocking path so a broker outage never
    /// stalls a caller.
    pub fn connect(host: &str, port: u16) -> Self {
        let mut options = MqttOptions::new("gartenbot-controller", host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 20);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. reconnecting...");
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client }
    }
}

impl Notifier for MqttNotifier {
    fn notify(&self, alert: &Alert) {
        let topic = format!("gartenbot/alert/{}", alert.kind);
        let payload = match serde_json::to_vec(alert) {
            Ok(p) => p,
            Err(e) => {
                warn!("alert serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
        {
            warn!(kind = %alert.kind, "alert publish failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_kind_wire_names() {
        assert_eq!(AlertKind::LowWater.as_str(), "low_water");
        assert_eq!(AlertKind::WateringStarted.as_str(), "watering_started");
    }

    #[test]
    fn alert_serializes_with_category_and_message() {
        let alert = Alert::new(AlertKind::Overheat, "board temperature 75.0°C");
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "overheat");
        assert_eq!(json["message"], "board temperature 75.0°C");
        assert!(json["at"].is_string());
    }

    #[test]
    fn log_notifier_swallows_everything() {
        LogNotifier.notify(&Alert::new(AlertKind::Fault, "relay unconfirmed"));
        LogNotifier.notify(&Alert::new(AlertKind::System, "started"));
    }
}
