use crate::dispatch::{DispatchTask, Dispatcher};
use crate::error::RelayError;
use crate::geofence::Geofence;
use crate::models::telemetry::TelemetryMessage;
use crate::notify::{Notifier, NotifyEvent};
use crate::rate_limit::RateLimiter;
use crate::record::MessageRecorder;
use crate::registry::Registry;
use crate::transport::InboundMessage;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Single consumer draining the inbound queue. Back-pressure is the
/// transport's concern; this loop processes one message at a time and fans
/// admitted sends out to the dispatch pool.
pub struct IngestLoop {
    registry: Arc<Registry>,
    limiter: Arc<RateLimiter>,
    dispatcher: Dispatcher,
    geofence: Geofence,
    notifier: Arc<dyn Notifier>,
    recorder: Option<MessageRecorder>,
}

impl IngestLoop {
    pub fn new(
        registry: Arc<Registry>,
        limiter: Arc<RateLimiter>,
        dispatcher: Dispatcher,
        geofence: Geofence,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            limiter,
            dispatcher,
            geofence,
            notifier,
            recorder: None,
        }
    }

    /// Archives raw inbound messages alongside processing them.
    pub fn with_recorder(mut self, recorder: MessageRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(msg) = rx.recv().await {
            if let Some(recorder) = self.recorder.as_mut() {
                if let Err(e) = recorder.record(&msg) {
                    warn!(error = %e, "failed to archive message");
                }
            }
            self.handle(msg);
        }
        info!("inbound queue closed, ingestion stopped");
    }

    /// Processes one message. Returns (dispatched, rate-limited) counts for
    /// the per-message summary. Every failure is scoped to this message.
    pub fn handle(&self, msg: InboundMessage) -> (usize, usize) {
        let telemetry = match TelemetryMessage::parse(&msg.payload, msg.received_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "dropping malformed message");
                self.notifier.notify(NotifyEvent::Alert(e.to_string()));
                return (0, 0);
            }
        };

        let Some(destinations) = self.registry.lookup(&telemetry.serial) else {
            let e = RelayError::UnknownDevice(telemetry.serial.clone());
            error!(serial = %telemetry.serial, "dropping message from unregistered device");
            self.notifier.notify(NotifyEvent::Alert(e.to_string()));
            return (0, 0);
        };

        if !self.geofence.validate(telemetry.latitude, telemetry.longitude) {
            return (0, 0);
        }

        if let Some(first) = destinations.first() {
            self.notifier.notify(NotifyEvent::ValidatedPosition {
                label: first.label.clone(),
                lat: telemetry.latitude,
                lon: telemetry.longitude,
            });
        }

        let producer_time = telemetry.producer_or_received();
        let now = Utc::now();
        let mut dispatched = 0;
        let mut skipped = 0;

        for dest in &destinations {
            if self
                .limiter
                .admit(Some(telemetry.serial.as_str()), &dest.token, now)
            {
                self.dispatcher.submit(DispatchTask {
                    serial: Some(telemetry.serial.clone()),
                    token: dest.token.clone(),
                    label: dest.label.clone(),
                    latitude: telemetry.latitude,
                    longitude: telemetry.longitude,
                    producer_time,
                    received_at: telemetry.received_at,
                });
                dispatched += 1;
            } else {
                let since = self
                    .limiter
                    .since_last(Some(telemetry.serial.as_str()), &dest.token, now)
                    .unwrap_or_default();
                info!(
                    label = %dest.label,
                    serial = %telemetry.serial,
                    since_last = since,
                    "rate limited, skipping send"
                );
                skipped += 1;
            }
        }

        info!(
            serial = %telemetry.serial,
            dispatched,
            skipped,
            destinations = destinations.len(),
            "message processed"
        );
        (dispatched, skipped)
    }
}
