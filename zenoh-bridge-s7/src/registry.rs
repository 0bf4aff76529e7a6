//! Active subscriptions, keyed by client-chosen id.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::codec::{self, PlcValue, ValueType};

/// Location inside a data block.
///
/// Any JSON number is accepted for each field and truncated to its integer
/// part; the result must fit the field's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Data block number.
    #[serde(deserialize_with = "truncated")]
    pub db: u16,
    /// Byte offset inside the block.
    #[serde(deserialize_with = "truncated")]
    pub byte: u32,
    /// Bit inside the byte (0-7); only read for bit values.
    #[serde(deserialize_with = "truncated")]
    pub bit: u8,
}

fn truncated<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let number = Number::deserialize(deserializer)?;
    let n = codec::truncate_number(&number)
        .ok_or_else(|| de::Error::custom(format!("{number} is not representable")))?;
    T::try_from(n).map_err(|_| de::Error::custom(format!("{n} is out of range")))
}

impl Address {
    pub fn new(db: u16, byte: u32, bit: u8) -> Self {
        Self { db, byte, bit }
    }
}

/// A typed binding from a client id to a device address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub address: Address,
    pub value_type: ValueType,
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// One entry of a subscribe list could not be parsed; nothing was applied.
    #[error("malformed subscription list (entry {index}): {reason}")]
    MalformedSubscriptionList { index: usize, reason: String },
}

#[derive(Debug, Clone)]
struct Entry {
    subscription: Subscription,
    last_value: Option<PlcValue>,
    failing: bool,
}

/// The set of active subscriptions.
///
/// Iteration follows id order, so two snapshots of the same members with the
/// same values always serialize identically.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace every subscription in `entries`.
    ///
    /// The list is validated as a whole before anything is applied: a single
    /// `Err` leaves the registry untouched. Duplicate ids within the list
    /// resolve to the last one. Returns the number of active subscriptions.
    pub fn subscribe_all<I, E>(&mut self, entries: I) -> Result<usize, RegistryError>
    where
        I: IntoIterator<Item = Result<Subscription, E>>,
        E: std::fmt::Display,
    {
        let mut parsed = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            match entry {
                Ok(subscription) => parsed.push(subscription),
                Err(e) => {
                    return Err(RegistryError::MalformedSubscriptionList {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        for subscription in parsed {
            self.entries.insert(
                subscription.id.clone(),
                Entry {
                    subscription,
                    last_value: None,
                    failing: false,
                },
            );
        }

        Ok(self.entries.len())
    }

    /// Drop every subscription.
    pub fn unsubscribe_all(&mut self) {
        self.entries.clear();
    }

    /// Ids in iteration order.
    pub fn snapshot_keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&Subscription> {
        self.entries.get(id).map(|e| &e.subscription)
    }

    /// Subscriptions in iteration order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values().map(|e| &e.subscription)
    }

    /// Last value observed for `id`, if any tick has read it.
    pub fn last_value(&self, id: &str) -> Option<PlcValue> {
        self.entries.get(id).and_then(|e| e.last_value)
    }

    /// Whether the last read of `id` failed.
    pub fn is_failing(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|e| e.failing)
    }

    pub(crate) fn record_value(&mut self, id: &str, value: PlcValue) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_value = Some(value);
            entry.failing = false;
        }
    }

    pub(crate) fn record_failure(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.failing = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
