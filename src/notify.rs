use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{error, info};

/// Discrete events surfaced to the operator notification channel.
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    Startup,
    Heartbeat,
    Registration { serial: String, token: String },
    ValidatedPosition { label: String, lat: f64, lon: f64 },
    Alert(String),
}

impl NotifyEvent {
    fn kind(&self) -> &'static str {
        match self {
            NotifyEvent::Startup => "startup",
            NotifyEvent::Heartbeat => "heartbeat",
            NotifyEvent::Registration { .. } => "registration",
            NotifyEvent::ValidatedPosition { .. } => "validated_position",
            NotifyEvent::Alert(_) => "alert",
        }
    }

    /// Client-side throttle per event kind, to avoid flooding the channel.
    /// Registrations are one-time by construction and pass unthrottled.
    fn throttle(&self) -> Option<Duration> {
        match self {
            NotifyEvent::Startup => Some(Duration::seconds(5)),
            NotifyEvent::Heartbeat => Some(Duration::seconds(21_600)),
            NotifyEvent::Registration { .. } => None,
            NotifyEvent::ValidatedPosition { .. } => Some(Duration::seconds(180)),
            NotifyEvent::Alert(_) => Some(Duration::seconds(600)),
        }
    }

    fn text(&self) -> String {
        match self {
            NotifyEvent::Startup => "Relay restarted.".to_string(),
            NotifyEvent::Heartbeat => "Live and running (heartbeat).".to_string(),
            NotifyEvent::Registration { serial, token } => {
                format!("New registration: {serial} -> {token}")
            }
            NotifyEvent::ValidatedPosition { label, lat, lon } => format!(
                "Position of <b>{label}</b> sent to map\nlat={lat:.5}, lon={lon:.5}\nhttps://www.google.com/maps?q={lat:.5},{lon:.5}"
            ),
            NotifyEvent::Alert(msg) => format!("Alert: {msg}"),
        }
    }
}

/// Seam to the notification collaborator. Fire-and-forget; implementations
/// must never block the caller on delivery.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent);
}

/// Drops every event. Used when no channel is configured and in tests.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: NotifyEvent) {}
}

/// Telegram bot API notifier. Throttles per event kind, then posts the
/// message from a spawned task so delivery latency never reaches the
/// pipeline; failures are logged and forgotten.
pub struct TelegramNotifier {
    http: reqwest::Client,
    url: String,
    chat_id: String,
    last_sent: Mutex<HashMap<&'static str, DateTime<Utc>>>,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
            chat_id: chat_id.to_string(),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn admit(&self, event: &NotifyEvent) -> bool {
        let Some(throttle) = event.throttle() else {
            return true;
        };
        let now = Utc::now();
        let mut last = self.last_sent.lock().expect("notifier lock poisoned");
        if let Some(prev) = last.get(event.kind()) {
            if now.signed_duration_since(*prev) < throttle {
                return false;
            }
        }
        last.insert(event.kind(), now);
        true
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, event: NotifyEvent) {
        if !self.admit(&event) {
            return;
        }

        let http = self.http.clone();
        let url = self.url.clone();
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": event.text(),
            "parse_mode": "HTML",
        });
        let kind = event.kind();

        tokio::spawn(async move {
            match http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(kind, "notification sent");
                }
                Ok(resp) => {
                    error!(kind, status = %resp.status(), "notification rejected");
                }
                Err(e) => {
                    error!(kind, error = %e, "notification send failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_repeated_alerts() {
        let notifier = TelegramNotifier::new("token", "42");
        let alert = NotifyEvent::Alert("unknown device".to_string());
        assert!(notifier.admit(&alert));
        assert!(!notifier.admit(&alert));
    }

    #[test]
    fn registrations_are_never_throttled() {
        let notifier = TelegramNotifier::new("token", "42");
        let ev = NotifyEvent::Registration {
            serial: "SN1".to_string(),
            token: "tok-A".to_string(),
        };
        assert!(notifier.admit(&ev));
        assert!(notifier.admit(&ev));
    }

    #[test]
    fn kinds_throttle_independently() {
        let notifier = TelegramNotifier::new("token", "42");
        assert!(notifier.admit(&NotifyEvent::Startup));
        assert!(notifier.admit(&NotifyEvent::Heartbeat));
        assert!(!notifier.admit(&NotifyEvent::Startup));
    }
}
