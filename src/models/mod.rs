pub mod registration;
pub mod telemetry;
