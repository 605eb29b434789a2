//! Companion state and its wire payload.
//!
//! The companion pushes its state as JSON:
//!
//! ```text
//! { "schema": 1, "data": { "appVersion": 123, "running": true } }
//! ```
//!
//! `running` is omitted while the companion itself does not know. The
//! payload comes from another application and is versioned independently,
//! so anything unexpected resolves to [`CompanionState::Unknown`].

use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

const EXPECTED_SCHEMA_VERSION: i64 = 1;

/// Observed companion state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompanionState {
    #[default]
    Unknown,
    Running,
    Stopped,
    /// Package missing or untrusted, no retry
    NotInstalled,
    /// Installed but does not expose the state service
    UpgradeRequired,
    /// Gave up reconnecting
    MaxRetriesExceeded,
}

impl CompanionState {
    pub fn is_running(&self) -> bool {
        matches!(self, CompanionState::Running)
    }

    /// No further updates will arrive without a restart of the manager.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompanionState::NotInstalled
                | CompanionState::UpgradeRequired
                | CompanionState::MaxRetriesExceeded
        )
    }

    /// Parse a state payload. Never fails.
    pub fn from_payload(payload: &str) -> Self {
        let json: Value = match serde_json::from_str(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!("Companion: failed to parse state JSON: {}", e);
                return CompanionState::Unknown;
            }
        };

        let schema = json.get("schema").and_then(Value::as_i64);
        if schema != Some(EXPECTED_SCHEMA_VERSION) {
            warn!("Companion: unexpected schema version: {:?}", json.get("schema"));
            return CompanionState::Unknown;
        }

        let Some(data) = json.get("data").and_then(Value::as_object) else {
            warn!("Companion: missing 'data' field in state JSON");
            return CompanionState::Unknown;
        };

        if let Some(version) = data.get("appVersion").and_then(Value::as_i64) {
            debug!("Companion: app version {}", version);
        }

        match data.get("running") {
            Some(Value::Bool(true)) => CompanionState::Running,
            Some(Value::Bool(false)) => CompanionState::Stopped,
            None => {
                debug!("Companion: running state not provided");
                CompanionState::Unknown
            }
            Some(other) => {
                warn!("Companion: malformed running state: {}", other);
                CompanionState::Unknown
            }
        }
    }
}

impl fmt::Display for CompanionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompanionState::Unknown => "unknown",
            CompanionState::Running => "running",
            CompanionState::Stopped => "stopped",
            CompanionState::NotInstalled => "not installed",
            CompanionState::UpgradeRequired => "upgrade required",
            CompanionState::MaxRetriesExceeded => "max retries exceeded",
        };
        f.write_str(name)
    }
}
