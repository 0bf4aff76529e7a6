//! The owned bridge object and its lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use s7bridge_common::BridgeStatus;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bus::{Channel, CommandSource, MessageBus};
use crate::device::{CpuStatus, PlcDevice, PlcInfo};
use crate::error::{BridgeError, Result};
use crate::poller::SnapshotBaseline;
use crate::registry::SubscriptionRegistry;

/// Resolves once `stop` reads true. A dropped sender never resolves.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *stop.borrow_and_update();
        if stopped {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Flips the stop flag when dropped, including while unwinding.
struct StopOnDrop(Arc<watch::Sender<bool>>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// Drive one loop to completion, logging its error and stopping its sibling.
async fn supervise<F>(name: &'static str, stop: Arc<watch::Sender<bool>>, work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let _stop = StopOnDrop(stop);
    let result = work.await;
    if let Err(e) = &result {
        error!(worker = name, error = %e, "Loop failed");
    }
    result
}

/// Everything the poll loop and the command loop mutate.
///
/// Guarded by one lock, taken for a whole tick or a whole command.
pub struct SharedState<D> {
    pub(crate) device: D,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) baseline: SnapshotBaseline,
    released: bool,
}

/// A PLC session, its subscriptions and a bus handle.
pub struct Bridge<D, B> {
    pub(crate) state: Arc<Mutex<SharedState<D>>>,
    pub(crate) bus: Arc<B>,
    pub(crate) poll_interval: Duration,
}

impl<D, B> Clone for Bridge<D, B> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            bus: self.bus.clone(),
            poll_interval: self.poll_interval,
        }
    }
}

impl<D: PlcDevice, B: MessageBus> Bridge<D, B> {
    pub fn new(device: D, bus: B, poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState {
                device,
                registry: SubscriptionRegistry::new(),
                baseline: SnapshotBaseline::default(),
                released: false,
            })),
            bus: Arc::new(bus),
            poll_interval,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Open the device session and report what the PLC says about itself.
    pub async fn connect(&self, address: &str, rack: u16, slot: u16) -> Result<PlcInfo> {
        let mut state = self.state.lock().await;

        info!(address = %address, rack, slot, "Connecting to PLC");
        state.device.connect(address, rack, slot).await?;
        state.released = false;

        let mut plc = state.device.info().await;
        plc.cpu = state.device.status().await;

        info!(
            order_code = plc.order_code.as_deref().unwrap_or("-"),
            firmware = plc.firmware.as_deref().unwrap_or("-"),
            module_type = plc.module_type.as_deref().unwrap_or("-"),
            serial_number = plc.serial_number.as_deref().unwrap_or("-"),
            module_name = plc.module_name.as_deref().unwrap_or("-"),
            "PLC info"
        );
        info!(
            pdu_requested = ?plc.pdu_requested,
            pdu_negotiated = ?plc.pdu_negotiated,
            "PDU size"
        );
        match plc.cpu {
            CpuStatus::Run => info!(address = %address, "Connected, CPU is in RUN"),
            CpuStatus::Stop => warn!(address = %address, "Connected, CPU is in STOP"),
            CpuStatus::Unknown => warn!(address = %address, "Connected, CPU state unknown"),
        }

        Ok(plc)
    }

    /// Number of active subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    /// Run `f` against the device while holding the state lock.
    pub async fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.state.lock().await.device)
    }

    /// Publish a lifecycle document on the status channel.
    pub async fn publish_status(&self, status: &BridgeStatus) -> Result<()> {
        let text = serde_json::to_string(status)?;
        self.bus.publish(Channel::Status, text).await?;
        Ok(())
    }

    /// Run the poll loop and the command loop until `shutdown` turns true or
    /// either loop fails, then release the device.
    ///
    /// Each loop is its own task. The first error stops the other loop and
    /// is returned; a panicking loop stops the other one as well.
    pub async fn run<S: CommandSource>(
        &self,
        commands: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let mut loops = JoinSet::new();
        loops.spawn(supervise("poll", stop_tx.clone(), {
            let bridge = self.clone();
            let stop = stop_rx.clone();
            async move { bridge.run_poll_loop(stop).await }
        }));
        loops.spawn(supervise("command", stop_tx.clone(), {
            let bridge = self.clone();
            let stop = stop_rx.clone();
            async move { bridge.run_command_loop(commands, stop).await }
        }));

        tokio::select! {
            _ = stop_requested(&mut shutdown) => {
                info!("Shutdown requested");
                stop_tx.send_replace(true);
            }
            _ = stop_requested(&mut stop_rx) => {}
        }

        let mut result = Ok(());
        while let Some(joined) = loops.join_next().await {
            result = result.and(joined.unwrap_or_else(|e| Err(e.into())));
        }

        self.close().await;
        result
    }

    /// Disconnect the device. Only the first call has an effect.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.released {
            return;
        }
        state.released = true;
        state.device.disconnect().await;
        info!("PLC session closed");
    }
}
