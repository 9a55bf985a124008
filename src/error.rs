// Error types for the BLE session

use thiserror::Error;

use crate::transaction::CharacteristicKind;

/// Failure reported by the platform BLE stack for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("peripheral not found: {0}")]
    PeripheralNotFound(String),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("operation rejected by peripheral: {0}")]
    Rejected(String),

    #[error("event stream already taken")]
    EventStreamTaken,
}

impl From<bluer::Error> for PlatformError {
    fn from(err: bluer::Error) -> Self {
        PlatformError::Adapter(err.to_string())
    }
}

/// Errors surfaced by session operations. None of them tear the session down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("another connection is in progress")]
    Busy,

    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] PlatformError),

    #[error("not connected")]
    NotConnected,

    #[error("transmission failed: {0}")]
    TransmissionFailed(#[source] PlatformError),

    #[error("read failed: {0}")]
    ReadFailed(#[source] PlatformError),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(#[source] PlatformError),

    #[error("validation failed: {0}")]
    ValidationFailed(&'static str),

    #[error("scan failed: {0}")]
    ScanFailed(#[source] PlatformError),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("no {kind} characteristic at index {index}")]
    UnknownCharacteristic {
        kind: CharacteristicKind,
        index: usize,
    },

    #[error("session closed")]
    SessionClosed,

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
