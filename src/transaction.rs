// Characteristic bookkeeping for read/write/notify transactions

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SessionError};

/// The four operation classes a characteristic can be offered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacteristicKind {
    WriteWithResponse,
    WriteWithoutResponse,
    Read,
    Notify,
}

impl fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CharacteristicKind::WriteWithResponse => "write",
            CharacteristicKind::WriteWithoutResponse => "write-without-response",
            CharacteristicKind::Read => "read",
            CharacteristicKind::Notify => "notify",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

impl WriteMode {
    pub fn kind(self) -> CharacteristicKind {
        match self {
            WriteMode::WithResponse => CharacteristicKind::WriteWithResponse,
            WriteMode::WithoutResponse => CharacteristicKind::WriteWithoutResponse,
        }
    }
}

/// A resolved GATT characteristic address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// A characteristic as reported by the platform after service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredCharacteristic {
    #[serde(flatten)]
    pub target: CharacteristicRef,
    pub properties: CharacteristicProperties,
}

/// Per-connection characteristic lists, one per operation class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicSet {
    pub write_with_response: Vec<CharacteristicRef>,
    pub write_without_response: Vec<CharacteristicRef>,
    pub read: Vec<CharacteristicRef>,
    pub notify: Vec<CharacteristicRef>,
}

impl CharacteristicSet {
    pub fn from_characteristics(characteristics: &[DiscoveredCharacteristic]) -> Self {
        let mut set = Self::default();
        for c in characteristics {
            let props = c.properties;
            if props.write {
                set.write_with_response.push(c.target);
            }
            if props.write_without_response {
                set.write_without_response.push(c.target);
            }
            if props.read {
                set.read.push(c.target);
            }
            if props.notify || props.indicate {
                set.notify.push(c.target);
            }
        }
        set
    }

    pub fn list(&self, kind: CharacteristicKind) -> &[CharacteristicRef] {
        match kind {
            CharacteristicKind::WriteWithResponse => &self.write_with_response,
            CharacteristicKind::WriteWithoutResponse => &self.write_without_response,
            CharacteristicKind::Read => &self.read,
            CharacteristicKind::Notify => &self.notify,
        }
    }

    /// UUID strings for display, in discovery order.
    pub fn uuids(&self, kind: CharacteristicKind) -> Vec<String> {
        self.list(kind)
            .iter()
            .map(|c| c.characteristic.to_string())
            .collect()
    }

    /// Whether the operation should be offered at all.
    pub fn offers(&self, kind: CharacteristicKind) -> bool {
        !self.list(kind).is_empty()
    }

    pub fn resolve(&self, kind: CharacteristicKind, index: usize) -> Result<CharacteristicRef> {
        self.list(kind)
            .get(index)
            .copied()
            .ok_or(SessionError::UnknownCharacteristic { kind, index })
    }

    pub fn clear(&mut self) {
        self.write_with_response.clear();
        self.write_without_response.clear();
        self.read.clear();
        self.notify.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.write_with_response.is_empty()
            && self.write_without_response.is_empty()
            && self.read.is_empty()
            && self.notify.is_empty()
    }
}

/// How notification bytes are turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEncoding {
    /// Lossy UTF-8.
    #[default]
    Text,
    /// Upper-case hex, whatever case the platform would have used.
    Hex,
}

pub fn decode_value(value: &[u8], encoding: NotificationEncoding) -> String {
    match encoding {
        NotificationEncoding::Text => String::from_utf8_lossy(value).into_owned(),
        NotificationEncoding::Hex => hex::encode_upper(value),
    }
}

/// Accumulated notification fragments.
#[derive(Debug, Clone, Default)]
pub struct ReceiveBuffer {
    fragments: Vec<String>,
}

impl ReceiveBuffer {
    /// Append a fragment and return the whole buffer.
    pub fn push(&mut self, fragment: String) -> String {
        self.fragments.push(fragment);
        self.contents()
    }

    pub fn contents(&self) -> String {
        self.fragments.concat()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.iter().all(String::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    #[default]
    NotSubscribed,
    Subscribed,
}

/// Display slots for the transaction layer.
#[derive(Debug, Default)]
pub struct TransactionState {
    pub receive: ReceiveBuffer,
    pub last_written: Option<Vec<u8>>,
    pub last_read: Option<Vec<u8>>,
    pub monitor: MonitorState,
}

impl TransactionState {
    /// Drop everything a disconnect invalidates. Monitoring is left alone.
    pub fn reset(&mut self) {
        self.receive.clear();
        self.last_written = None;
        self.last_read = None;
    }

    pub fn record_write(&mut self, payload: Vec<u8>) {
        self.receive.clear();
        self.last_written = Some(payload);
    }
}

pub fn validate_payload(payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(SessionError::ValidationFailed("payload is empty"));
    }
    Ok(())
}
