use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A raw message handed over by the transport, stamped with the local receipt
/// time before it enters the queue.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Seam to the pub/sub transport collaborator. The relay only ever asks it to
/// subscribe to a device's OSD topic; connection handling lives outside this
/// crate.
pub trait Transport: Send + Sync {
    fn subscribe(&self, serial: &str);
}

/// Topic a device publishes its OSD telemetry on.
pub fn osd_topic(serial: &str) -> String {
    format!("thing/product/{serial}/osd")
}

/// In-process transport: tracks subscriptions and feeds the inbound queue.
/// Used as the integration point for the external broker client, by the
/// offline replay tool, and by tests.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<InboundMessage>,
    topics: Mutex<HashSet<String>>,
}

impl ChannelTransport {
    /// Publishes a raw payload into the inbound queue, stamping it with the
    /// current receipt time.
    pub fn publish(&self, payload: serde_json::Value) {
        let msg = InboundMessage {
            payload,
            received_at: Utc::now(),
        };
        if self.tx.send(msg).is_err() {
            warn!("inbound queue closed, dropping message");
        }
    }

    pub fn is_subscribed(&self, serial: &str) -> bool {
        self.topics
            .lock()
            .expect("topic set lock poisoned")
            .contains(&osd_topic(serial))
    }
}

impl Transport for ChannelTransport {
    fn subscribe(&self, serial: &str) {
        let topic = osd_topic(serial);
        let inserted = self
            .topics
            .lock()
            .expect("topic set lock poisoned")
            .insert(topic.clone());
        if inserted {
            info!(topic, "subscribed to device topic");
        }
    }
}

/// Builds the inbound queue and its publishing side.
pub fn channel() -> (ChannelTransport, mpsc::UnboundedReceiver<InboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            tx,
            topics: Mutex::new(HashSet::new()),
        },
        rx,
    )
}
