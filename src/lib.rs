//! Relays live drone position telemetry to a mapping service.
//!
//! Messages arrive from a pub/sub transport, are validated against a
//! geofence, matched against a periodically reconciled device registry,
//! rate-limited per (device, destination), and fanned out to a worker pool
//! that sends position reports and diagnoses end-to-end delay. Delivery is
//! best-effort: a dropped report is superseded by the next periodic one.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod geofence;
pub mod ingest;
pub mod models;
pub mod notify;
pub mod rate_limit;
pub mod record;
pub mod registry;
pub mod replay;
pub mod sink;
pub mod transport;
