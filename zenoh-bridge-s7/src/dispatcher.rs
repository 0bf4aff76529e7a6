//! Inbound request handling.
//!
//! Requests are JSON documents of the form
//!
//! ```text
//! {"command": "subscribe" | "unsubscribe" | "write",
//!  "dbs": [{"id": "...", "address": {"db": 1, "byte": 0, "bit": 0},
//!           "valueType": "bool" | "byte" | "int", "value": ...}]}
//! ```
//!
//! Success is silent. Anything that cannot be understood is answered on the
//! response channel with `invalid request: ` followed by the original text.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, SharedState, stop_requested};
use crate::bus::{Channel, CommandSource, MessageBus};
use crate::codec::{self, CodecError, PlcValue, ValueType, WritePlan};
use crate::device::{DeviceError, PlcDevice};
use crate::error::{BridgeError, Result};
use crate::registry::{Address, RegistryError, Subscription};

/// Prefix of every error reply.
pub const INVALID_REQUEST_PREFIX: &str = "invalid request: ";

/// Build the error reply for a rejected request.
pub fn invalid_request_reply(original: &str) -> String {
    format!("{INVALID_REQUEST_PREFIX}{original}")
}

/// Problems with a single `dbs` entry.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error(transparent)]
    Shape(#[from] serde_json::Error),
    #[error("missing field '{0}'")]
    Missing(&'static str),
    #[error("field '{field}' must be {expected}")]
    Invalid {
        field: &'static str,
        expected: &'static str,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Reasons a request is rejected.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing or non-string 'command'")]
    MissingCommand,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("missing or non-array 'dbs'")]
    MissingDbs,
    #[error(transparent)]
    Subscribe(#[from] RegistryError),
    #[error("write entry {index}: {source}")]
    Write {
        index: usize,
        #[source]
        source: DescriptorError,
    },
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A recognised command, borrowing its `dbs` entries from the document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command<'a> {
    Subscribe(&'a [Value]),
    Unsubscribe,
    Write(&'a [Value]),
}

/// A parsed `write` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub subscription: Subscription,
    pub value: PlcValue,
}

fn dbs(doc: &Value) -> std::result::Result<&[Value], RequestError> {
    doc.get("dbs")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or(RequestError::MissingDbs)
}

/// Identify the command of a request document.
pub fn parse_command(doc: &Value) -> std::result::Result<Command<'_>, RequestError> {
    let command = doc
        .get("command")
        .and_then(Value::as_str)
        .ok_or(RequestError::MissingCommand)?;

    match command {
        "subscribe" => Ok(Command::Subscribe(dbs(doc)?)),
        "unsubscribe" => Ok(Command::Unsubscribe),
        "write" => Ok(Command::Write(dbs(doc)?)),
        other => Err(RequestError::UnknownCommand(other.to_string())),
    }
}

/// One `dbs` entry as it appears on the wire.
///
/// `value` is only required by `write`; `subscribe` ignores it.
#[derive(Debug, Deserialize)]
struct Descriptor {
    id: String,
    address: Address,
    #[serde(rename = "valueType")]
    value_type: String,
    #[serde(default)]
    value: Option<Value>,
}

fn parse_descriptor(
    entry: &Value,
) -> std::result::Result<(Subscription, Option<Value>), DescriptorError> {
    let Descriptor {
        id,
        address,
        value_type,
        value,
    } = Descriptor::deserialize(entry)?;

    if address.bit > 7 {
        return Err(DescriptorError::Invalid {
            field: "bit",
            expected: "between 0 and 7",
        });
    }

    let subscription = Subscription {
        id,
        address,
        value_type: value_type.parse()?,
    };
    Ok((subscription, value))
}

/// Parse the `id`, `address` and `valueType` of a `dbs` entry.
pub fn parse_subscription(entry: &Value) -> std::result::Result<Subscription, DescriptorError> {
    parse_descriptor(entry).map(|(subscription, _)| subscription)
}

/// Parse a `write` entry: a subscription descriptor plus its `value`.
///
/// Numbers outside the type's range wrap to its low bits.
pub fn parse_write(entry: &Value) -> std::result::Result<WriteRequest, DescriptorError> {
    let (subscription, raw) = parse_descriptor(entry)?;
    let raw = raw.ok_or(DescriptorError::Missing("value"))?;

    let value = match subscription.value_type {
        ValueType::Bit => raw.as_bool().map(PlcValue::Bit).ok_or(DescriptorError::Invalid {
            field: "value",
            expected: "a boolean",
        })?,
        ValueType::Byte | ValueType::Word => {
            let n = raw
                .as_number()
                .and_then(codec::truncate_number)
                .ok_or(DescriptorError::Invalid {
                    field: "value",
                    expected: "a number",
                })?;
            if subscription.value_type == ValueType::Byte {
                PlcValue::byte_wrapping(n)
            } else {
                PlcValue::word_wrapping(n)
            }
        }
    };

    Ok(WriteRequest {
        subscription,
        value,
    })
}

/// Store one value on the device. Bits go through a read-modify-write of
/// their byte.
pub async fn apply_write<D: PlcDevice>(
    device: &mut D,
    request: &WriteRequest,
) -> std::result::Result<(), DeviceError> {
    let Address { db, byte, bit } = request.subscription.address;

    match codec::plan_write(request.value, bit) {
        WritePlan::ReadModifyWrite { bit, value } => {
            let io = |message: String| DeviceError::Io {
                db,
                offset: byte,
                len: 1,
                message,
            };

            let current = device.read_bytes(db, byte, 1).await?;
            let existing = *current
                .first()
                .ok_or_else(|| io("empty read".to_string()))?;
            let updated = codec::encode_bit(existing, bit, value).map_err(|e| io(e.to_string()))?;
            device.write_bytes(db, byte, &[updated]).await
        }
        WritePlan::Direct(bytes) => device.write_bytes(db, byte, &bytes).await,
    }
}

async fn dispatch<D: PlcDevice>(
    state: &mut SharedState<D>,
    text: &str,
) -> std::result::Result<(), DispatchError> {
    let doc: Value = serde_json::from_str(text).map_err(RequestError::from)?;
    debug!(request = %doc, "New request");

    match parse_command(&doc)? {
        Command::Subscribe(entries) => {
            let count = state
                .registry
                .subscribe_all(entries.iter().map(parse_subscription))
                .map_err(RequestError::from)?;
            info!("Currently subscribed to {} addresses", count);
            debug!(ids = ?state.registry.snapshot_keys(), "Active subscriptions");
        }
        Command::Unsubscribe => {
            info!("Clearing subscriptions");
            state.registry.unsubscribe_all();
        }
        Command::Write(entries) => {
            // Entries before a malformed one have already reached the device.
            for (index, entry) in entries.iter().enumerate() {
                let request =
                    parse_write(entry).map_err(|source| RequestError::Write { index, source })?;
                apply_write(&mut state.device, &request).await?;
                debug!(
                    id = %request.subscription.id,
                    value = ?request.value,
                    "Wrote value"
                );
            }
        }
    }

    Ok(())
}

impl<D: PlcDevice, B: MessageBus> Bridge<D, B> {
    /// Handle one inbound message.
    ///
    /// Returns an error only when the device connection is lost; everything
    /// else is answered on the bus or logged.
    pub async fn handle_message(&self, text: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        match dispatch(&mut state, text).await {
            Ok(()) => Ok(()),
            Err(DispatchError::Request(e)) => {
                warn!(error = %e, "Rejected request");
                if let Err(e) = self
                    .bus
                    .publish(Channel::Response, invalid_request_reply(text))
                    .await
                {
                    warn!(error = %e, "Failed to send error reply");
                }
                Ok(())
            }
            Err(DispatchError::Device(e)) if e.is_fatal() => Err(BridgeError::Device(e)),
            Err(DispatchError::Device(e)) => {
                warn!(error = %e, "Write failed, remaining entries skipped");
                Ok(())
            }
        }
    }

    /// Handle inbound messages one at a time until `stop` turns true.
    ///
    /// A message being handled when `stop` flips is finished first.
    pub async fn run_command_loop<S: CommandSource>(
        &self,
        mut commands: S,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Waiting for commands");

        loop {
            tokio::select! {
                _ = stop_requested(&mut stop) => break,
                message = commands.next_message() => match message {
                    Some(text) => self.handle_message(&text).await?,
                    None => return Err(BridgeError::BusClosed),
                },
            }
        }

        debug!("Command loop stopped");
        Ok(())
    }
}
