//! Change-detecting poll loop.
//!
//! Every tick reads all subscriptions, serializes the result and publishes it
//! on the response channel only when the text differs from the last one that
//! was published.

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, stop_requested};
use crate::bus::{Channel, MessageBus};
use crate::codec::{self, PlcValue, ValueType};
use crate::device::{DeviceError, PlcDevice};
use crate::error::Result;
use crate::registry::{Address, Subscription, SubscriptionRegistry};

/// One subscription and the value observed for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEntry {
    pub id: String,
    pub address: Address,
    #[serde(rename = "valueType")]
    pub value_type: ValueType,
    pub value: PlcValue,
}

/// Values of every subscription at one tick, in registry order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub dbs: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Canonical JSON text used both for publishing and change detection.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&SnapshotEntry> {
        self.dbs.iter().find(|e| e.id == id)
    }
}

/// Text of the last published snapshot.
#[derive(Debug, Default)]
pub struct SnapshotBaseline {
    last: Option<String>,
}

impl SnapshotBaseline {
    /// Whether `text` differs from what was last published.
    pub fn is_new(&self, text: &str) -> bool {
        self.last.as_deref() != Some(text)
    }

    pub fn commit(&mut self, text: String) {
        self.last = Some(text);
    }
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A changed snapshot with this many entries was published.
    Published(usize),
    /// Nothing changed since the last publish.
    Unchanged,
    /// The snapshot changed but publishing failed; retried next tick.
    PublishFailed,
}

async fn read_value<D: PlcDevice>(
    device: &mut D,
    subscription: &Subscription,
) -> std::result::Result<PlcValue, DeviceError> {
    let Address { db, byte, bit } = subscription.address;
    let width = subscription.value_type.width();

    let raw = device.read_bytes(db, byte, width).await?;
    codec::decode(subscription.value_type, bit, &raw).map_err(|e| DeviceError::Io {
        db,
        offset: byte,
        len: width,
        message: e.to_string(),
    })
}

/// Read every subscription once, in registry order.
///
/// A failed read does not abort the tick: the entry carries the last value
/// read for it, or zero if it was never read. Only a lost connection is
/// returned as an error.
pub async fn read_snapshot<D: PlcDevice>(
    device: &mut D,
    registry: &mut SubscriptionRegistry,
) -> std::result::Result<Snapshot, DeviceError> {
    let mut dbs = Vec::with_capacity(registry.len());
    let mut observed = Vec::with_capacity(registry.len());

    for subscription in registry.iter() {
        let value = match read_value(device, subscription).await {
            Ok(value) => {
                if registry.is_failing(&subscription.id) {
                    info!(id = %subscription.id, "Read recovered");
                }
                observed.push((subscription.id.clone(), Some(value)));
                value
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                if registry.is_failing(&subscription.id) {
                    debug!(id = %subscription.id, error = %e, "Read still failing");
                } else {
                    warn!(id = %subscription.id, error = %e, "Read failed, reporting last known value");
                }
                observed.push((subscription.id.clone(), None));
                registry
                    .last_value(&subscription.id)
                    .unwrap_or_else(|| subscription.value_type.zero())
            }
        };

        dbs.push(SnapshotEntry {
            id: subscription.id.clone(),
            address: subscription.address,
            value_type: subscription.value_type,
            value,
        });
    }

    for (id, value) in observed {
        match value {
            Some(value) => registry.record_value(&id, value),
            None => registry.record_failure(&id),
        }
    }

    Ok(Snapshot { dbs })
}

impl<D: PlcDevice, B: MessageBus> Bridge<D, B> {
    /// Run one poll tick.
    ///
    /// Holds the state lock for the whole tick so a command can never land
    /// between two reads of the same snapshot.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let snapshot = read_snapshot(&mut state.device, &mut state.registry).await?;
        let text = snapshot.to_json()?;

        if !state.baseline.is_new(&text) {
            return Ok(PollOutcome::Unchanged);
        }

        match self.bus.publish(Channel::Response, text.clone()).await {
            Ok(()) => {
                debug!(entries = snapshot.dbs.len(), "Published new subscription state");
                state.baseline.commit(text);
                Ok(PollOutcome::Published(snapshot.dbs.len()))
            }
            Err(e) => {
                warn!(error = %e, "Failed to publish subscription state");
                Ok(PollOutcome::PublishFailed)
            }
        }
    }

    /// Tick until `stop` turns true or the device connection is lost.
    pub async fn run_poll_loop(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "Starting poll loop"
        );

        loop {
            tokio::select! {
                _ = stop_requested(&mut stop) => break,
                _ = interval.tick() => {
                    self.poll_once().await?;
                }
            }
        }

        debug!("Poll loop stopped");
        Ok(())
    }
}
