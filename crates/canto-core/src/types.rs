//! Core domain types shared across Canto crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Debounced verdict about the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    pub fn from_down(down: bool) -> Self {
        if down { HealthStatus::Down } else { HealthStatus::Up }
    }

    pub fn is_down(self) -> bool {
        self == HealthStatus::Down
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Up => write!(f, "up"),
            HealthStatus::Down => write!(f, "down"),
        }
    }
}

/// Body returned by the backend health endpoint.
///
/// The `ok` field is kept as raw JSON because backends disagree on its
/// encoding; use [`HealthResponse::is_ok`] to interpret it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub ok: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl HealthResponse {
    /// Whether the backend reported itself healthy.
    ///
    /// Accepts boolean `true`, numeric `1` and the string `"true"`.
    /// Anything else, including a missing field, is a failure.
    pub fn is_ok(&self) -> bool {
        match &self.ok {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64() == Some(1.0),
            serde_json::Value::String(s) => s == "true",
            _ => false,
        }
    }
}
