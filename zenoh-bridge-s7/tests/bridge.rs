//! End-to-end behaviour of the bridge over the simulated PLC and the
//! in-memory bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Notify, watch};
use tokio_test::{assert_err, assert_ok};
use zenoh_bridge_s7::Bridge;
use zenoh_bridge_s7::bus::{Channel, MemoryBus};
use zenoh_bridge_s7::device::{CpuStatus, DeviceError, PlcDevice, SimulatedPlc};
use zenoh_bridge_s7::error::BridgeError;
use zenoh_bridge_s7::poller::PollOutcome;

async fn connected_bridge() -> Bridge<SimulatedPlc, MemoryBus> {
    let plc = SimulatedPlc::new().with_block(1, 16).with_block(2, 4);
    let bridge = Bridge::new(plc, MemoryBus::new(), Duration::from_millis(5));
    assert_ok!(bridge.connect("192.168.1.101", 0, 0).await);
    bridge
}

async fn send(bridge: &Bridge<SimulatedPlc, MemoryBus>, request: Value) {
    assert_ok!(bridge.handle_message(&request.to_string()).await);
}

fn responses(bridge: &Bridge<SimulatedPlc, MemoryBus>) -> Vec<String> {
    bridge.bus().on(Channel::Response)
}

async fn db(bridge: &Bridge<SimulatedPlc, MemoryBus>, db: u16) -> Vec<u8> {
    bridge
        .with_device(|d| d.block(db).map(<[u8]>::to_vec).unwrap_or_default())
        .await
}

fn snapshot_ids(snapshot: &Value) -> Vec<String> {
    snapshot["dbs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap().to_string())
        .collect()
}

/// Pauses the next read until released, so a tick can be held open.
#[derive(Default)]
struct Gate {
    armed: AtomicBool,
    reached: Notify,
    open: Notify,
}

struct GatedPlc {
    inner: SimulatedPlc,
    gate: Arc<Gate>,
}

impl PlcDevice for GatedPlc {
    async fn connect(&mut self, address: &str, rack: u16, slot: u16) -> Result<(), DeviceError> {
        self.inner.connect(address, rack, slot).await
    }

    async fn disconnect(&mut self) {
        self.inner.disconnect().await
    }

    async fn read_bytes(&mut self, db: u16, offset: u32, len: usize) -> Result<Vec<u8>, DeviceError> {
        if self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.reached.notify_one();
            self.gate.open.notified().await;
        }
        self.inner.read_bytes(db, offset, len).await
    }

    async fn write_bytes(&mut self, db: u16, offset: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.inner.write_bytes(db, offset, data).await
    }

    async fn status(&mut self) -> CpuStatus {
        self.inner.status().await
    }
}

#[tokio::test]
async fn subscribe_then_poll_publishes_snapshot() {
    let bridge = connected_bridge().await;
    bridge.with_device(|d| d.poke(1, 0, &[0b0000_0001])).await;

    send(
        &bridge,
        json!({"command": "subscribe", "dbs": [
            {"id": "A", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "bool"}
        ]}),
    )
    .await;
    assert!(responses(&bridge).is_empty(), "subscribe is silent");

    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Published(1));
    assert_eq!(
        responses(&bridge),
        vec![r#"{"dbs":[{"id":"A","address":{"db":1,"byte":0,"bit":0},"valueType":"bool","value":true}]}"#]
    );
}

#[tokio::test]
async fn unchanged_values_publish_once() {
    let bridge = connected_bridge().await;
    send(
        &bridge,
        json!({"command": "subscribe", "dbs": [
            {"id": "w", "address": {"db": 2, "byte": 0, "bit": 0}, "valueType": "int"}
        ]}),
    )
    .await;

    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Published(1));
    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Unchanged);
    assert_eq!(responses(&bridge).len(), 1);

    bridge.with_device(|d| d.poke(2, 0, &[0x01, 0x00])).await;
    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Published(1));

    let last: Value = serde_json::from_str(&responses(&bridge)[1]).unwrap();
    assert_eq!(last["dbs"][0]["value"], json!(256));
}

#[tokio::test]
async fn malformed_subscribe_applies_nothing() {
    let bridge = connected_bridge().await;
    let request = json!({"command": "subscribe", "dbs": [
        {"id": "ok", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "byte"},
        {"id": "bad", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "float"}
    ]})
    .to_string();

    assert_ok!(bridge.handle_message(&request).await);
    assert_eq!(bridge.subscription_count().await, 0);
    assert_eq!(responses(&bridge), vec![format!("invalid request: {request}")]);
}

#[tokio::test]
async fn unsubscribe_then_resubscribe() {
    let bridge = connected_bridge().await;
    let subscribe = json!({"command": "subscribe", "dbs": [
        {"id": "b", "address": {"db": 1, "byte": 3, "bit": 0}, "valueType": "byte"}
    ]});

    send(&bridge, subscribe.clone()).await;
    assert_ok!(bridge.poll_once().await);

    send(&bridge, json!({"command": "unsubscribe"})).await;
    assert_eq!(bridge.subscription_count().await, 0);
    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Published(0));
    assert_eq!(responses(&bridge).last().unwrap(), r#"{"dbs":[]}"#);

    send(&bridge, subscribe).await;
    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Published(1));
    assert_eq!(responses(&bridge).len(), 3);
}

#[tokio::test]
async fn failed_read_keeps_all_ids() {
    let bridge = connected_bridge().await;
    send(
        &bridge,
        json!({"command": "subscribe", "dbs": [
            {"id": "a", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "bool"},
            {"id": "b", "address": {"db": 99, "byte": 0, "bit": 0}, "valueType": "int"},
            {"id": "c", "address": {"db": 1, "byte": 1, "bit": 0}, "valueType": "byte"}
        ]}),
    )
    .await;

    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Published(3));

    let snapshot: Value = serde_json::from_str(&responses(&bridge)[0]).unwrap();
    assert_eq!(snapshot_ids(&snapshot), vec!["a", "b", "c"]);
    assert_eq!(snapshot["dbs"][1]["value"], json!(0));
}

#[tokio::test]
async fn write_bit_preserves_neighbours() {
    let bridge = connected_bridge().await;
    bridge.with_device(|d| d.poke(1, 4, &[0b1000_0001])).await;

    let write = |value: bool| {
        json!({"command": "write", "dbs": [
            {"id": "x", "address": {"db": 1, "byte": 4, "bit": 3}, "valueType": "bool", "value": value}
        ]})
    };

    send(&bridge, write(true)).await;
    assert_eq!(db(&bridge, 1).await[4], 0b1000_1001);

    send(&bridge, write(false)).await;
    assert_eq!(db(&bridge, 1).await[4], 0b1000_0001);
    assert!(responses(&bridge).is_empty(), "write is silent");
}

#[tokio::test]
async fn write_byte_and_word() {
    let bridge = connected_bridge().await;
    send(
        &bridge,
        json!({"command": "write", "dbs": [
            {"id": "y", "address": {"db": 2, "byte": 0, "bit": 0}, "valueType": "byte", "value": 255},
            {"id": "w", "address": {"db": 2, "byte": 2, "bit": 0}, "valueType": "int", "value": -2}
        ]}),
    )
    .await;

    assert_eq!(db(&bridge, 2).await, vec![0xFF, 0x00, 0xFF, 0xFE]);
}

#[tokio::test]
async fn malformed_write_replies_with_original_text() {
    let bridge = connected_bridge().await;
    let request = r#"{"command":"write","dbs":[{"id":"A"}]}"#;

    assert_ok!(bridge.handle_message(request).await);
    assert_eq!(
        responses(&bridge),
        vec![r#"invalid request: {"command":"write","dbs":[{"id":"A"}]}"#]
    );
}

#[tokio::test]
async fn malformed_write_keeps_earlier_entries() {
    let bridge = connected_bridge().await;
    let request = json!({"command": "write", "dbs": [
        {"id": "first", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "byte", "value": 7},
        {"id": "broken", "address": {"db": 1, "byte": 1, "bit": 0}, "valueType": "byte"},
        {"id": "never", "address": {"db": 1, "byte": 2, "bit": 0}, "valueType": "byte", "value": 9}
    ]})
    .to_string();

    assert_ok!(bridge.handle_message(&request).await);

    let block = db(&bridge, 1).await;
    assert_eq!(&block[..3], &[7, 0, 0]);
    assert_eq!(responses(&bridge), vec![format!("invalid request: {request}")]);
}

#[tokio::test]
async fn write_to_missing_block_is_not_a_reply() {
    let bridge = connected_bridge().await;
    send(
        &bridge,
        json!({"command": "write", "dbs": [
            {"id": "far", "address": {"db": 42, "byte": 0, "bit": 0}, "valueType": "byte", "value": 1}
        ]}),
    )
    .await;

    assert!(responses(&bridge).is_empty());
}

#[tokio::test]
async fn device_error_skips_remaining_write_entries() {
    let bridge = connected_bridge().await;
    send(
        &bridge,
        json!({"command": "write", "dbs": [
            {"id": "first", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "byte", "value": 7},
            {"id": "far", "address": {"db": 42, "byte": 0, "bit": 0}, "valueType": "byte", "value": 1},
            {"id": "after", "address": {"db": 1, "byte": 2, "bit": 0}, "valueType": "byte", "value": 9}
        ]}),
    )
    .await;

    let block = db(&bridge, 1).await;
    assert_eq!(block[0], 7);
    assert_eq!(block[2], 0, "entries after the failed write are not applied");
    assert!(responses(&bridge).is_empty());
}

#[tokio::test]
async fn float_address_fields_are_truncated() {
    let bridge = connected_bridge().await;
    bridge.with_device(|d| d.poke(1, 3, &[0x11])).await;

    send(
        &bridge,
        json!({"command": "subscribe", "dbs": [
            {"id": "f", "address": {"db": 1.0, "byte": 3.0, "bit": 0.0}, "valueType": "byte"}
        ]}),
    )
    .await;

    assert!(responses(&bridge).is_empty());
    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Published(1));
    assert_eq!(
        responses(&bridge),
        vec![r#"{"dbs":[{"id":"f","address":{"db":1,"byte":3,"bit":0},"valueType":"byte","value":17}]}"#]
    );
}

#[tokio::test]
async fn command_waits_for_tick_in_progress() {
    let gate = Arc::new(Gate::default());
    let plc = GatedPlc {
        inner: SimulatedPlc::new().with_block(1, 4),
        gate: gate.clone(),
    };
    let bridge = Bridge::new(plc, MemoryBus::new(), Duration::from_millis(5));
    assert_ok!(bridge.connect("plc", 0, 0).await);
    bridge.with_device(|d| d.inner.poke(1, 1, &[5])).await;

    let subscribe = json!({"command": "subscribe", "dbs": [
        {"id": "a", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "byte"},
        {"id": "b", "address": {"db": 1, "byte": 1, "bit": 0}, "valueType": "byte"}
    ]});
    assert_ok!(bridge.handle_message(&subscribe.to_string()).await);

    gate.armed.store(true, Ordering::SeqCst);
    let poller = bridge.clone();
    let tick = tokio::spawn(async move { poller.poll_once().await });
    gate.reached.notified().await;

    let commander = bridge.clone();
    let command = tokio::spawn(async move {
        let write = json!({"command": "write", "dbs": [
            {"id": "b", "address": {"db": 1, "byte": 1, "bit": 0}, "valueType": "byte", "value": 99}
        ]});
        let subscribe = json!({"command": "subscribe", "dbs": [
            {"id": "c", "address": {"db": 1, "byte": 2, "bit": 0}, "valueType": "byte"}
        ]});
        commander.handle_message(&write.to_string()).await?;
        commander.handle_message(&subscribe.to_string()).await
    });

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!command.is_finished(), "command ran while a tick was reading");

    gate.open.notify_one();
    assert_eq!(assert_ok!(tick.await.unwrap()), PollOutcome::Published(2));
    assert_ok!(command.await.unwrap());

    let first: Value = serde_json::from_str(&bridge.bus().on(Channel::Response)[0]).unwrap();
    assert_eq!(snapshot_ids(&first), vec!["a", "b"]);
    assert_eq!(first["dbs"][1]["value"], json!(5));

    assert_eq!(assert_ok!(bridge.poll_once().await), PollOutcome::Published(3));
    let second: Value = serde_json::from_str(&bridge.bus().on(Channel::Response)[1]).unwrap();
    assert_eq!(snapshot_ids(&second), vec!["a", "b", "c"]);
    assert_eq!(second["dbs"][1]["value"], json!(99));
}

#[tokio::test]
async fn invalid_requests_get_error_reply() {
    let bridge = connected_bridge().await;
    let requests = [
        "not json",
        r#"{"dbs":[]}"#,
        r#"{"command":"read","dbs":[]}"#,
        r#"{"command":"subscribe"}"#,
    ];

    for request in requests {
        assert_ok!(bridge.handle_message(request).await);
    }

    let expected: Vec<_> = requests
        .iter()
        .map(|r| format!("invalid request: {r}"))
        .collect();
    assert_eq!(responses(&bridge), expected);
}

#[tokio::test]
async fn lost_connection_is_fatal() {
    let bridge = connected_bridge().await;
    bridge.close().await;

    let err = assert_err!(
        bridge
            .handle_message(
                &json!({"command": "write", "dbs": [
                    {"id": "y", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "byte", "value": 1}
                ]})
                .to_string()
            )
            .await
    );
    assert!(matches!(err, BridgeError::Device(e) if e.is_fatal()));
}

#[tokio::test]
async fn run_serves_commands_and_polls() {
    let bridge = connected_bridge().await;
    bridge.with_device(|d| d.poke(1, 0, &[0x2A])).await;

    let (tx, commands) = MemoryBus::command_channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = bridge.clone();
    let handle = tokio::spawn(async move { runner.run(commands, shutdown_rx).await });

    tx.send(
        json!({"command": "subscribe", "dbs": [
            {"id": "v", "address": {"db": 1, "byte": 0, "bit": 0}, "valueType": "byte"}
        ]})
        .to_string(),
    )
    .await
    .unwrap();

    let expected = r#"{"dbs":[{"id":"v","address":{"db":1,"byte":0,"bit":0},"valueType":"byte","value":42}]}"#;
    let mut seen = false;
    for _ in 0..200 {
        if responses(&bridge).iter().any(|r| r == expected) {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seen, "snapshot was never published");

    shutdown_tx.send_replace(true);
    assert_ok!(handle.await.unwrap());
    assert!(!bridge.with_device(|d| d.is_connected()).await);
}
