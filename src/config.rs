// Configuration for the BLE client

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::identity::IdentityStrategy;
use crate::transaction::NotificationEncoding;

/// Prefix for environment overrides, e.g. `BLE_CLIENT__CLIENT__TARGET`.
pub const ENV_PREFIX: &str = "BLE_CLIENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bluetooth: BluetoothConfig,
    pub session: SessionConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter name such as `hci0`; the default adapter when unset.
    pub adapter: Option<String>,
    /// Power the adapter on at startup.
    pub power_on: bool,
    /// Length of one scan window before the stack reports scan-stopped.
    pub scan_seconds: u64,
    pub identity: IdentityStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Start scanning whenever the adapter reports power on.
    pub auto_scan_on_power_on: bool,
    /// Log completions that arrive after their connection is gone.
    pub log_late_callbacks: bool,
    /// Warn when a peripheral's MAC cannot be recovered.
    pub warn_on_missing_mac: bool,
    pub notification_encoding: NotificationEncoding,
    /// Capacity of the session update channel.
    pub update_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Send file contents as base64 text.
    #[default]
    Base64,
    Raw,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection id, MAC address or advertised name to connect to.
    pub target: Option<String>,
    pub payload: Option<String>,
    pub payload_file: Option<PathBuf>,
    pub payload_encoding: PayloadEncoding,
    pub write_without_response: bool,
    pub subscribe_after_connect: bool,
    pub read_after_connect: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            power_on: true,
            scan_seconds: default_scan_seconds(),
            identity: IdentityStrategy::MacAddressed,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_scan_on_power_on: true,
            log_late_callbacks: false,
            warn_on_missing_mac: false,
            notification_encoding: NotificationEncoding::Text,
            update_capacity: default_update_capacity(),
        }
    }
}

fn default_scan_seconds() -> u64 {
    5
}

fn default_update_capacity() -> usize {
    256
}

/// Load configuration from an optional file, then environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<Config, ::config::ConfigError> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(::config::File::from(path).required(false));
    }
    builder
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?
        .try_deserialize()
}
