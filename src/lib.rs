pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod error_tracker;
pub mod hub;
pub mod network;
pub mod performance;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod task;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{Result, SitewatchError};

// ---------------------------------------------------------------------------
// Room and event catalogue
// ---------------------------------------------------------------------------

/// Room receiving deduplicated error records.
pub const ERRORS_ROOM: &str = "errors-room";
/// Room receiving performance and network telemetry updates.
pub const METRICS_ROOM: &str = "metrics-room";

pub const EVENT_ERROR_OCCURRED: &str = "error-occurred";
pub const EVENT_PERFORMANCE_UPDATE: &str = "performance-update";
pub const EVENT_NETWORK_UPDATE: &str = "network-update";
pub const EVENT_SYSTEM_ALERT: &str = "system-alert";

/// Pass-through events relayed for the external anomaly-detection collaborator.
pub const EVENT_AUTONOMOUS_ERROR: &str = "autonomous-error-detected";
pub const EVENT_AUTO_FIX_ATTEMPT: &str = "auto-fix-attempt";

// ---------------------------------------------------------------------------
// System alerts (broadcast to every connected client)
// ---------------------------------------------------------------------------

/// Severity of a broadcast system alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// An alert fanned out to all dashboard clients under `"system-alert"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAlert {
    #[serde(rename = "type")]
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: u64,
    pub component: String,
}

impl SystemAlert {
    pub fn new(level: AlertLevel, component: &str, message: impl Into<String>) -> Self {
        SystemAlert {
            level,
            message: message.into(),
            timestamp: now_ms(),
            component: component.to_string(),
        }
    }
}

/// Build an alert and broadcast it to every connected client.
///
/// Best-effort: a hub with zero subscribers simply drops the message.
pub fn emit_alert(
    pubsub: &dyn hub::PubSub,
    level: AlertLevel,
    component: &str,
    message: impl Into<String>,
) {
    let alert = SystemAlert::new(level, component, message);
    match serde_json::to_value(&alert) {
        Ok(payload) => pubsub.publish(hub::Scope::All, EVENT_SYSTEM_ALERT, payload),
        Err(e) => tracing::warn!(component, error = %e, "failed to serialize system alert"),
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_nonzero() {
        assert!(now_ms() > 0);
    }

    #[test]
    fn test_alert_level_display() {
        assert_eq!(AlertLevel::Info.to_string(), "info");
        assert_eq!(AlertLevel::Warning.to_string(), "warning");
        assert_eq!(AlertLevel::Critical.to_string(), "critical");
    }

    #[test]
    fn test_system_alert_serializes_level_as_type() {
        let alert = SystemAlert::new(AlertLevel::Critical, "scheduler", "pass rate dropped");
        let v = serde_json::to_value(&alert).unwrap();
        assert_eq!(v["type"], "critical");
        assert_eq!(v["component"], "scheduler");
        assert!(v["timestamp"].as_u64().unwrap() > 0);
    }
}
