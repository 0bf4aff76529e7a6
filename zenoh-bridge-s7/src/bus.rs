//! Message bus transport.
//!
//! Outbound text goes to one of two channels through [`MessageBus`]; inbound
//! requests arrive one at a time from a [`CommandSource`]. [`ZenohBus`] maps
//! both onto Zenoh key expressions, [`MemoryBus`] keeps everything in process.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use s7bridge_common::BridgeKeys;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use zenoh::Session;
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::{Sample, SampleKind};

/// Outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Bridge lifecycle status.
    Status,
    /// Snapshots and error replies.
    Response,
}

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to publish to {key}: {message}")]
    Publish { key: String, message: String },

    #[error("failed to subscribe to {key}: {message}")]
    Subscribe { key: String, message: String },
}

/// Publishing side of the bus.
pub trait MessageBus: Send + Sync + 'static {
    fn publish(
        &self,
        channel: Channel,
        text: String,
    ) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Receiving side of the bus.
pub trait CommandSource: Send + 'static {
    /// Wait for the next inbound message. `None` once the source is closed.
    fn next_message(&mut self) -> impl Future<Output = Option<String>> + Send;
}

/// Bus backed by a Zenoh session.
#[derive(Clone, Debug)]
pub struct ZenohBus {
    session: Arc<Session>,
    keys: BridgeKeys,
}

impl ZenohBus {
    pub fn new(session: Arc<Session>, keys: BridgeKeys) -> Self {
        Self { session, keys }
    }

    pub fn keys(&self) -> &BridgeKeys {
        &self.keys
    }

    fn key(&self, channel: Channel) -> String {
        match channel {
            Channel::Status => self.keys.status(),
            Channel::Response => self.keys.response(),
        }
    }

    /// Subscribe to the command key expression.
    pub async fn commands(&self) -> Result<ZenohCommands, BusError> {
        let key = self.keys.commands();
        let subscriber = self
            .session
            .declare_subscriber(&key)
            .await
            .map_err(|e| BusError::Subscribe {
                key: key.clone(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Subscribed to commands");

        Ok(ZenohCommands { subscriber })
    }
}

impl MessageBus for ZenohBus {
    async fn publish(&self, channel: Channel, text: String) -> Result<(), BusError> {
        let key = self.key(channel);
        self.session
            .put(&key, text)
            .await
            .map_err(|e| BusError::Publish {
                key,
                message: e.to_string(),
            })
    }
}

/// Inbound commands from a Zenoh subscriber.
pub struct ZenohCommands {
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
}

impl CommandSource for ZenohCommands {
    async fn next_message(&mut self) -> Option<String> {
        loop {
            let sample = match self.subscriber.recv_async().await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(error = %e, "Command subscriber closed");
                    return None;
                }
            };

            if sample.kind() == SampleKind::Delete {
                trace!(key = %sample.key_expr(), "Ignoring delete sample");
                continue;
            }

            match sample.payload().try_to_string() {
                Ok(text) => return Some(text.into_owned()),
                Err(e) => {
                    warn!(
                        key = %sample.key_expr(),
                        error = %e,
                        "Dropping non UTF-8 command"
                    );
                }
            }
        }
    }
}

/// In-process bus that records everything published to it.
#[derive(Clone, Debug, Default)]
pub struct MemoryBus {
    published: Arc<Mutex<Vec<(Channel, String)>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(Channel, String)>> {
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<(Channel, String)> {
        self.lock().clone()
    }

    /// Texts published to `channel`, in order.
    pub fn on(&self, channel: Channel) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Forget everything published so far.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// A command source fed through the returned sender.
    pub fn command_channel(capacity: usize) -> (mpsc::Sender<String>, MemoryCommands) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, MemoryCommands { rx })
    }
}

impl MessageBus for MemoryBus {
    async fn publish(&self, channel: Channel, text: String) -> Result<(), BusError> {
        self.lock().push((channel, text));
        Ok(())
    }
}

/// Command source backed by an mpsc channel.
#[derive(Debug)]
pub struct MemoryCommands {
    rx: mpsc::Receiver<String>,
}

impl CommandSource for MemoryCommands {
    async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bus_records_by_channel() {
        let bus = MemoryBus::new();
        bus.publish(Channel::Response, "a".to_string()).await.unwrap();
        bus.publish(Channel::Status, "s".to_string()).await.unwrap();
        bus.publish(Channel::Response, "b".to_string()).await.unwrap();

        assert_eq!(bus.on(Channel::Response), vec!["a", "b"]);
        assert_eq!(bus.on(Channel::Status), vec!["s"]);
        assert_eq!(bus.published().len(), 3);

        bus.clear();
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_memory_commands_close() {
        let (tx, mut commands) = MemoryBus::command_channel(4);
        tx.send("one".to_string()).await.unwrap();
        drop(tx);

        assert_eq!(commands.next_message().await.as_deref(), Some("one"));
        assert_eq!(commands.next_message().await, None);
    }
}
