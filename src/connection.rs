// Single-slot connection state machine

use serde::Serialize;

use crate::error::{Result, SessionError};
use crate::transaction::{CharacteristicSet, DiscoveredCharacteristic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// What the platform reports once a peripheral is connected and its
/// services have been discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralInfo {
    pub id: String,
    pub name: Option<String>,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Identifies one in-flight connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTicket {
    epoch: u64,
    peripheral_id: String,
}

impl ConnectTicket {
    pub fn peripheral_id(&self) -> &str {
        &self.peripheral_id
    }
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    state: ConnectionState,
    /// Bumped whenever a connection is torn down; callbacks carrying an
    /// older epoch belong to a dead session.
    epoch: u64,
    target: Option<String>,
    peripheral: Option<PeripheralInfo>,
    characteristics: CharacteristicSet,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True while `epoch` still names the live connection.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.is_connected() && self.epoch == epoch
    }

    /// Id of the peripheral being connected to or connected.
    pub fn target_id(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn peripheral(&self) -> Option<&PeripheralInfo> {
        self.peripheral.as_ref()
    }

    pub fn characteristics(&self) -> &CharacteristicSet {
        &self.characteristics
    }

    /// Start a connect attempt. Anything but `Idle` is rejected: there is
    /// only one slot and attempts are never queued.
    pub fn begin_connect(&mut self, peripheral_id: &str) -> Result<ConnectTicket> {
        if self.state != ConnectionState::Idle {
            return Err(SessionError::Busy);
        }
        self.state = ConnectionState::Connecting;
        self.target = Some(peripheral_id.to_string());
        Ok(ConnectTicket {
            epoch: self.epoch,
            peripheral_id: peripheral_id.to_string(),
        })
    }

    fn owns(&self, ticket: &ConnectTicket) -> bool {
        self.state == ConnectionState::Connecting
            && self.epoch == ticket.epoch
            && self.target.as_deref() == Some(ticket.peripheral_id.as_str())
    }

    /// Apply a successful connect. Returns false if the ticket is stale.
    pub fn complete_connect(&mut self, ticket: &ConnectTicket, info: PeripheralInfo) -> bool {
        if !self.owns(ticket) {
            return false;
        }
        self.characteristics = CharacteristicSet::from_characteristics(&info.characteristics);
        self.peripheral = Some(info);
        self.state = ConnectionState::Connected;
        true
    }

    /// Revert a failed connect to `Idle`. Returns false if the ticket is stale.
    pub fn fail_connect(&mut self, ticket: &ConnectTicket) -> bool {
        if !self.owns(ticket) {
            return false;
        }
        self.state = ConnectionState::Idle;
        self.target = None;
        true
    }

    /// Connected -> Disconnecting. Returns the id to hand to the platform.
    pub fn begin_disconnect(&mut self) -> Result<String> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.state = ConnectionState::Disconnecting;
        self.target.clone().ok_or(SessionError::NotConnected)
    }

    /// Disconnecting -> Idle, invalidating the characteristic cache.
    pub fn finish_disconnect(&mut self) {
        self.state = ConnectionState::Idle;
        self.epoch += 1;
        self.target = None;
        self.peripheral = None;
        self.characteristics.clear();
    }

    /// Peripheral-initiated disconnect. Returns false if `peripheral_id` is
    /// not the connected peripheral.
    pub fn peer_disconnected(&mut self, peripheral_id: &str) -> bool {
        if !self.is_connected() || self.target.as_deref() != Some(peripheral_id) {
            return false;
        }
        self.state = ConnectionState::Disconnecting;
        self.finish_disconnect();
        true
    }

    /// Invalidate every outstanding ticket, e.g. on session teardown.
    pub fn abandon(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Idle;
            self.target = None;
        }
        self.epoch += 1;
    }
}
