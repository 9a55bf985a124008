// Single-peripheral BLE client session

pub mod app;
pub mod bluetooth;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod identity;
pub mod payload;
pub mod platform;
pub mod registry;
pub mod scan;
pub mod session;
pub mod transaction;

pub use error::{PlatformError, Result, SessionError};
pub use events::{BleEvent, EventKind};
pub use platform::BlePlatform;
pub use session::{Completion, Session, SessionPhase, SessionUpdate};
