//! Bridge status reporting.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Running,
    Offline,
    Error,
}

/// Status document published on the bridge's status channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g. "s7").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current state.
    pub status: Lifecycle,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Additional metadata (PLC target, CPU state, ...).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    fn with_state(bridge: impl Into<String>, version: impl Into<String>, status: Lifecycle) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status,
            timestamp: chrono::Utc::now().timestamp_millis(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a status in the "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, Lifecycle::Running)
    }

    /// Create a status in the "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, Lifecycle::Offline)
    }

    /// Create a status in the "error" state carrying the error text.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_state(bridge, version, Lifecycle::Error)
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Attach metadata, flattened into the top-level document.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Serialize to the JSON text put on the bus.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
