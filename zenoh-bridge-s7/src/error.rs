//! Top-level bridge errors.

use thiserror::Error;

use crate::bus::BusError;
use crate::device::DeviceError;

/// Errors that stop the bridge.
///
/// Request validation problems never surface here; they are answered on the
/// response channel and the bridge keeps running.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Device failure that could not be recovered locally.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Bus failure outside the per-message path.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The inbound command stream ended.
    #[error("Inbound command stream closed")]
    BusClosed,

    /// A poll or command task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A snapshot or status document could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;
