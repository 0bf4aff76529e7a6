//! Device transport.
//!
//! The bridge only needs raw byte access to data blocks plus a CPU status
//! query. [`PlcDevice`] is the seam; protocol framing lives in its
//! implementations. [`SimulatedPlc`] keeps the data blocks in memory.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, info};

/// Device access errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Connecting to the PLC failed.
    #[error("failed to connect to {address} (rack={rack}, slot={slot}): {message}")]
    Connect {
        address: String,
        rack: u16,
        slot: u16,
        message: String,
    },

    /// A single read or write was rejected. The session is still usable.
    #[error("DB{db}.{offset} ({len} byte(s)): {message}")]
    Io {
        db: u16,
        offset: u32,
        len: usize,
        message: String,
    },

    /// The session is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl DeviceError {
    /// Whether the error ends the session and should stop the bridge.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::ConnectionLost(_))
    }
}

/// CPU run state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuStatus {
    Run,
    Stop,
    #[default]
    Unknown,
}

/// Identity and session parameters reported by a PLC after connecting.
///
/// Fields the device does not report are left out of the JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlcInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    /// PDU size asked for during session setup, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdu_requested: Option<u16>,
    /// PDU size the PLC agreed to, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdu_negotiated: Option<u16>,
    pub cpu: CpuStatus,
}

/// Raw access to a PLC's data blocks.
///
/// Sessions are not safe to share between concurrent calls; the bridge
/// serializes all access through `&mut self`.
///
/// The poll and command loops run as tokio tasks. Implementations backed by
/// a blocking client must move each call off the executor, for example with
/// `tokio::task::spawn_blocking`.
pub trait PlcDevice: Send + 'static {
    /// Open a session to the PLC.
    fn connect(
        &mut self,
        address: &str,
        rack: u16,
        slot: u16,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Close the session. Closing an already closed session is a no-op.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// Read `len` bytes from data block `db` starting at `offset`.
    fn read_bytes(
        &mut self,
        db: u16,
        offset: u32,
        len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, DeviceError>> + Send;

    /// Write `data` to data block `db` starting at `offset`.
    fn write_bytes(
        &mut self,
        db: u16,
        offset: u32,
        data: &[u8],
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Query the CPU run state.
    fn status(&mut self) -> impl Future<Output = CpuStatus> + Send;

    /// Query identity and negotiated PDU sizes. `cpu` is filled in by the
    /// caller.
    fn info(&mut self) -> impl Future<Output = PlcInfo> + Send {
        async { PlcInfo::default() }
    }
}

const SIMULATED_PDU: u16 = 480;

/// An in-memory PLC with a fixed set of zero-initialized data blocks.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPlc {
    blocks: BTreeMap<u16, Vec<u8>>,
    connected: bool,
}

impl SimulatedPlc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or resize) data block `db` with `size` bytes.
    pub fn with_block(mut self, db: u16, size: usize) -> Self {
        self.blocks.entry(db).or_default().resize(size, 0);
        self
    }

    /// Direct view of a block, bypassing the session.
    pub fn block(&self, db: u16) -> Option<&[u8]> {
        self.blocks.get(&db).map(Vec::as_slice)
    }

    /// Poke bytes into a block, bypassing the session.
    ///
    /// Returns `false` if the range is outside the block.
    pub fn poke(&mut self, db: u16, offset: usize, data: &[u8]) -> bool {
        match self.blocks.get_mut(&db) {
            Some(block) if offset + data.len() <= block.len() => {
                block[offset..offset + data.len()].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn range(&self, db: u16, offset: u32, len: usize) -> Result<std::ops::Range<usize>, DeviceError> {
        let io = |message: String| DeviceError::Io {
            db,
            offset,
            len,
            message,
        };

        if !self.connected {
            return Err(DeviceError::ConnectionLost("not connected".to_string()));
        }
        let block = self
            .blocks
            .get(&db)
            .ok_or_else(|| io("address out of range: no such data block".to_string()))?;

        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= block.len())
            .ok_or_else(|| io(format!("address out of range: block is {} bytes", block.len())))?;

        Ok(start..end)
    }
}

impl PlcDevice for SimulatedPlc {
    async fn connect(&mut self, address: &str, rack: u16, slot: u16) -> Result<(), DeviceError> {
        info!(
            address,
            rack,
            slot,
            blocks = self.blocks.len(),
            "Connected to simulated PLC"
        );
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            debug!("Disconnecting simulated PLC");
        }
        self.connected = false;
    }

    async fn read_bytes(&mut self, db: u16, offset: u32, len: usize) -> Result<Vec<u8>, DeviceError> {
        let range = self.range(db, offset, len)?;
        Ok(self.blocks[&db][range].to_vec())
    }

    async fn write_bytes(&mut self, db: u16, offset: u32, data: &[u8]) -> Result<(), DeviceError> {
        let range = self.range(db, offset, data.len())?;
        if let Some(block) = self.blocks.get_mut(&db) {
            block[range].copy_from_slice(data);
        }
        Ok(())
    }

    async fn status(&mut self) -> CpuStatus {
        if self.connected {
            CpuStatus::Run
        } else {
            CpuStatus::Unknown
        }
    }

    async fn info(&mut self) -> PlcInfo {
        if !self.connected {
            return PlcInfo::default();
        }
        PlcInfo {
            order_code: Some("SIM 000-0SIM0-0AB0".to_string()),
            firmware: Some(env!("CARGO_PKG_VERSION").to_string()),
            module_type: Some("Simulated CPU".to_string()),
            serial_number: None,
            module_name: Some(format!("SIM ({} data blocks)", self.blocks.len())),
            pdu_requested: Some(SIMULATED_PDU),
            pdu_negotiated: Some(SIMULATED_PDU),
            cpu: CpuStatus::Unknown,
        }
    }
}
