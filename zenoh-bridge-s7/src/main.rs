//! Zenoh bridge for Siemens S7 data blocks.
//!
//! Polls the subscribed addresses of a PLC and publishes a JSON snapshot on
//! every change; accepts subscribe, unsubscribe and write requests over Zenoh.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use s7bridge_common::BridgeStatus;
use tokio::sync::watch;
use tracing::{error, info};
use zenoh_bridge_s7::Bridge;
use zenoh_bridge_s7::bus::ZenohBus;
use zenoh_bridge_s7::config::S7BridgeConfig;

const BRIDGE_NAME: &str = "s7";

/// Zenoh bridge for Siemens S7 PLCs.
#[derive(Parser, Debug)]
#[command(name = "zenoh-bridge-s7")]
#[command(about = "Bridges S7 data blocks to Zenoh as JSON")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "s7bridge.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// PLC address, overrides `plc.address`
    address: Option<String>,

    /// Rack number, overrides `plc.rack`
    #[arg(requires = "slot")]
    rack: Option<u16>,

    /// Slot number, overrides `plc.slot`
    #[arg(requires = "rack")]
    slot: Option<u16>,
}

impl Args {
    fn apply(&self, config: &mut S7BridgeConfig) {
        if let Some(address) = &self.address {
            config.plc.address = address.clone();
        }
        if let (Some(rack), Some(slot)) = (self.rack, self.slot) {
            config.plc.rack = rack;
            config.plc.slot = slot;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = S7BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    args.apply(&mut config);
    config.validate().context("Invalid command line override")?;

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    s7bridge_common::init_tracing(&log_config).context("Failed to init tracing")?;

    let version = env!("CARGO_PKG_VERSION");
    info!(version, "Starting zenoh-bridge-s7");
    info!("Loaded configuration from {:?}", args.config);

    // Connect to Zenoh
    let session = Arc::new(
        s7bridge_common::connect(&config.zenoh)
            .await
            .context("Failed to connect to Zenoh")?,
    );

    let bus = ZenohBus::new(session.clone(), config.bridge.keys());
    let commands = bus
        .commands()
        .await
        .context("Failed to subscribe to commands")?;

    // Connect to the PLC
    let plc = &config.plc;
    let bridge = Bridge::new(plc.simulated(), bus, config.bridge.poll_interval());
    let info = bridge
        .connect(&plc.address, plc.rack, plc.slot)
        .await
        .with_context(|| format!("Failed to connect to PLC at {}", plc.address))?;

    let running = BridgeStatus::running(BRIDGE_NAME, version).with_metadata(serde_json::json!({
        "plc": {
            "address": plc.address,
            "rack": plc.rack,
            "slot": plc.slot,
            "info": info,
        }
    }));
    if let Err(e) = bridge.publish_status(&running).await {
        error!("Failed to publish bridge status: {}", e);
    }

    // Wait for shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown_tx.send_replace(true);
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    info!(keys = %bridge.bus().keys().prefix(), "S7 bridge running");
    let result = bridge.run(commands, shutdown_rx).await;

    let subscriptions = bridge.subscription_count().await;
    let last = match &result {
        Ok(()) => BridgeStatus::offline(BRIDGE_NAME, version)
            .with_metadata(serde_json::json!({ "subscriptions": subscriptions })),
        Err(e) => BridgeStatus::error(BRIDGE_NAME, version, e.to_string()),
    };
    if let Err(e) = bridge.publish_status(&last).await {
        error!("Failed to publish bridge status: {}", e);
    }

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    info!("S7 bridge stopped");

    result.context("Bridge stopped with an error")
}
