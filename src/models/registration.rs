use serde::{Deserialize, Serialize};

/// One row from the registry source: a device allowed to publish to one
/// destination token under a display label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRow {
    pub serial: String,
    pub label: String,
    pub token: String,
    pub email: Option<String>,
}

/// One mapping target for a device: where reports go and under which label
/// they appear on the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub token: String,
    pub label: String,
}
