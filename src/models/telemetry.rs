use crate::error::{RelayError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// Wire shape of an inbound OSD message. Deserialized strictly so that a
/// missing `data`, `sn`, `host`, `latitude` or `longitude` surfaces as a
/// validation failure at the boundary instead of propagating downstream.
#[derive(Debug, Deserialize)]
struct OsdPayload {
    data: OsdData,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OsdData {
    sn: String,
    host: HostPosition,
}

#[derive(Debug, Deserialize)]
struct HostPosition {
    latitude: f64,
    longitude: f64,
}

/// A validated telemetry fix, the only shape the pipeline works with.
#[derive(Debug, Clone)]
pub struct TelemetryMessage {
    pub serial: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Producer-side timestamp (FlightHub-style epoch milliseconds), if the
    /// message carried one.
    pub producer_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

impl TelemetryMessage {
    pub fn parse(payload: &serde_json::Value, received_at: DateTime<Utc>) -> Result<Self> {
        let osd: OsdPayload = serde_json::from_value(payload.clone())
            .map_err(|e| RelayError::Validation(e.to_string()))?;

        let producer_time = osd
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(Self {
            serial: osd.data.sn,
            latitude: osd.data.host.latitude,
            longitude: osd.data.host.longitude,
            producer_time,
            received_at,
        })
    }

    /// Producer time with the local receipt time as fallback when the message
    /// carried no usable timestamp.
    pub fn producer_or_received(&self) -> DateTime<Utc> {
        self.producer_time.unwrap_or(self.received_at)
    }
}
