use thiserror::Error;

/// Errors produced by the relay pipeline.
///
/// None of these are fatal to the process: each one is scoped to a single
/// message or a single reconciliation cycle and is handled by logging and
/// dropping the offending unit of work.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid telemetry payload: {0}")]
    Validation(String),

    #[error("device {0} not present in registry")]
    UnknownDevice(String),

    #[error("destination {token} already uses label {label:?} for device {existing}")]
    RegistryConflict {
        token: String,
        label: String,
        existing: String,
    },

    #[error("position report failed: {0}")]
    Dispatch(String),

    #[error("registry source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
