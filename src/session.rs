// Top-level BLE session: ties scanning, connection and transactions together

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionState, PeripheralInfo};
use crate::error::{Result, SessionError};
use crate::events::{self, BleEvent, BleEventHandler, EventBus};
use crate::identity::{self, IdentityStrategy, RawAdvertisement};
use crate::platform::BlePlatform;
use crate::registry::{DeviceRegistry, DiscoveredDevice};
use crate::scan::{AdapterState, AdapterTransition, ScanController};
use crate::transaction::{
    decode_value, validate_payload, CharacteristicKind, CharacteristicRef, CharacteristicSet,
    MonitorState, TransactionState, WriteMode,
};

/// Combined scan and connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

/// Result of an operation whose platform callback may arrive after the
/// session has moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    Applied(T),
    /// The callback belonged to a connection that no longer exists.
    Discarded,
}

impl<T> Completion<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Completion::Applied(value) => Some(value),
            Completion::Discarded => None,
        }
    }
}

/// State changes pushed to observers (the rendering side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    AdapterState(AdapterState),
    Scanning(bool),
    /// The visible device list.
    Devices(Vec<DiscoveredDevice>),
    Connected(PeripheralInfo),
    ConnectFailed(String),
    Disconnected(String),
    Written(Vec<u8>),
    ReadValue(Vec<u8>),
    Monitoring(bool),
    /// Full accumulated notification text.
    ReceiveBuffer(String),
}

#[derive(Default)]
struct SessionState {
    registry: DeviceRegistry,
    scan: ScanController,
    connection: ConnectionManager,
    transactions: TransactionState,
    closed: bool,
}

impl SessionState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SessionError::SessionClosed);
        }
        Ok(())
    }

    fn phase(&self) -> SessionPhase {
        match self.connection.state() {
            ConnectionState::Connecting => SessionPhase::Connecting,
            ConnectionState::Connected => SessionPhase::Connected,
            ConnectionState::Disconnecting => SessionPhase::Disconnecting,
            ConnectionState::Idle if self.scan.is_scanning() => SessionPhase::Scanning,
            ConnectionState::Idle => SessionPhase::Idle,
        }
    }

    /// Everything while browsing, only the peripheral once connected.
    fn visible_devices(&self) -> Vec<DiscoveredDevice> {
        if self.connection.is_connected() {
            self.connection
                .target_id()
                .and_then(|id| self.registry.get(id))
                .cloned()
                .into_iter()
                .collect()
        } else {
            self.registry.snapshot()
        }
    }

    /// Target for a transaction on the live connection.
    fn transaction_target(
        &self,
        kind: CharacteristicKind,
        index: usize,
    ) -> Result<(String, CharacteristicRef, u64)> {
        self.ensure_open()?;
        if !self.connection.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let id = self
            .connection
            .target_id()
            .ok_or(SessionError::NotConnected)?
            .to_string();
        let target = self.connection.characteristics().resolve(kind, index)?;
        Ok((id, target, self.connection.epoch()))
    }
}

struct SessionInner {
    platform: Arc<dyn BlePlatform>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionInner {
    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn discard(&self, what: &str) {
        if self.config.log_late_callbacks {
            info!("Discarding late {} callback", what);
        }
    }

    fn after_disconnect(&self, state: &mut SessionState, id: &str) {
        state.transactions.reset();
        state.registry.set_connecting(id, false);
        info!("Disconnected from {}", id);
        self.publish(SessionUpdate::Disconnected(id.to_string()));
        self.publish(SessionUpdate::ReceiveBuffer(String::new()));
        self.publish(SessionUpdate::Devices(state.visible_devices()));
    }

    fn stop_scan_locked(&self, state: &mut SessionState) {
        if state.scan.stop() {
            self.platform.stop_scan();
            info!("Scan stopped");
            self.publish(SessionUpdate::Scanning(false));
        }
    }

    async fn start_scan(&self) -> Result<Completion<()>> {
        let generation = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            if state.connection.state() != ConnectionState::Idle {
                return Err(SessionError::Busy);
            }
            // A running scan is restarted.
            self.stop_scan_locked(&mut state);
            match state.scan.begin_start() {
                Ok(generation) => generation,
                Err(err) => {
                    warn!("Cannot scan, adapter is {}", state.scan.adapter_state());
                    self.platform.check_state();
                    return Err(err);
                }
            }
        };

        let result = self.platform.scan().await;

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                let idle = !state.closed && state.connection.state() == ConnectionState::Idle;
                if idle && state.scan.finish_start(generation) {
                    info!("Scanning for peripherals");
                    self.publish(SessionUpdate::Scanning(true));
                    Ok(Completion::Applied(()))
                } else {
                    self.platform.stop_scan();
                    self.discard("scan start");
                    Ok(Completion::Discarded)
                }
            }
            Err(err) => {
                warn!("Scan start failed: {}", err);
                Err(SessionError::ScanFailed(err))
            }
        }
    }

    fn stop_scan(&self) {
        let mut state = self.state.lock();
        self.stop_scan_locked(&mut state);
    }

    async fn connect(&self, id: &str) -> Result<Completion<PeripheralInfo>> {
        let ticket = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            if state.connection.state() != ConnectionState::Idle {
                debug!("Rejecting connect to {}, connection slot busy", id);
                return Err(SessionError::Busy);
            }
            if !state.scan.adapter_state().is_on() {
                return Err(SessionError::AdapterUnavailable);
            }
            if state.registry.get(id).is_none() {
                return Err(SessionError::UnknownDevice(id.to_string()));
            }

            self.stop_scan_locked(&mut state);
            let ticket = state.connection.begin_connect(id)?;
            state.registry.set_connecting(id, true);
            self.publish(SessionUpdate::Devices(state.visible_devices()));
            ticket
        };

        info!("Connecting to {}", id);
        let result = self.platform.connect(ticket.peripheral_id()).await;

        let mut state = self.state.lock();
        state.registry.set_connecting(id, false);
        match result {
            Ok(info) => {
                if state.closed || !state.connection.complete_connect(&ticket, info.clone()) {
                    // Nobody is waiting for this link any more.
                    self.platform.disconnect(id);
                    self.discard("connect");
                    return Ok(Completion::Discarded);
                }
                info!(
                    "Connected to {} ({} characteristics)",
                    id,
                    info.characteristics.len()
                );
                self.publish(SessionUpdate::Connected(info.clone()));
                self.publish(SessionUpdate::Devices(state.visible_devices()));
                Ok(Completion::Applied(info))
            }
            Err(err) => {
                if !state.connection.fail_connect(&ticket) {
                    self.discard("connect failure");
                    return Ok(Completion::Discarded);
                }
                warn!("Connection to {} failed: {}", id, err);
                self.publish(SessionUpdate::ConnectFailed(id.to_string()));
                self.publish(SessionUpdate::Devices(state.visible_devices()));
                Err(SessionError::ConnectionFailed(err))
            }
        }
    }

    fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.connection.begin_disconnect()?;
        self.platform.disconnect(&id);
        state.connection.finish_disconnect();
        self.after_disconnect(&mut state, &id);
        Ok(())
    }

    async fn write(&self, payload: &[u8], index: usize, mode: WriteMode) -> Result<Completion<()>> {
        let (id, target, epoch) = {
            let state = self.state.lock();
            let target = state.transaction_target(mode.kind(), index)?;
            validate_payload(payload)?;
            target
        };

        debug!(
            "Writing {} bytes to {} ({:?})",
            payload.len(),
            target.characteristic,
            mode
        );
        let result = match mode {
            WriteMode::WithResponse => self.platform.write(&id, &target, payload).await,
            WriteMode::WithoutResponse => {
                self.platform
                    .write_without_response(&id, &target, payload)
                    .await
            }
        };

        let mut state = self.state.lock();
        if !state.connection.is_current(epoch) {
            self.discard("write");
            return Ok(Completion::Discarded);
        }
        match result {
            Ok(()) => {
                state.transactions.record_write(payload.to_vec());
                self.publish(SessionUpdate::Written(payload.to_vec()));
                self.publish(SessionUpdate::ReceiveBuffer(String::new()));
                Ok(Completion::Applied(()))
            }
            Err(err) => {
                warn!("Write to {} failed: {}", target.characteristic, err);
                Err(SessionError::TransmissionFailed(err))
            }
        }
    }

    async fn read(&self, index: usize) -> Result<Completion<Vec<u8>>> {
        let (id, target, epoch) = self
            .state
            .lock()
            .transaction_target(CharacteristicKind::Read, index)?;

        let result = self.platform.read(&id, &target).await;

        let mut state = self.state.lock();
        if !state.connection.is_current(epoch) {
            self.discard("read");
            return Ok(Completion::Discarded);
        }
        match result {
            Ok(value) => {
                debug!("Read {} bytes from {}", value.len(), target.characteristic);
                state.transactions.last_read = Some(value.clone());
                self.publish(SessionUpdate::ReadValue(value.clone()));
                Ok(Completion::Applied(value))
            }
            Err(err) => {
                warn!("Read from {} failed: {}", target.characteristic, err);
                Err(SessionError::ReadFailed(err))
            }
        }
    }

    async fn subscribe(&self, index: usize) -> Result<Completion<()>> {
        let (id, target, epoch) = self
            .state
            .lock()
            .transaction_target(CharacteristicKind::Notify, index)?;

        let result = self.platform.start_notification(&id, &target).await;

        let mut state = self.state.lock();
        if !state.connection.is_current(epoch) {
            self.discard("subscribe");
            return Ok(Completion::Discarded);
        }
        match result {
            Ok(()) => {
                info!("Subscribed to {}", target.characteristic);
                state.transactions.monitor = MonitorState::Subscribed;
                self.publish(SessionUpdate::Monitoring(true));
                Ok(Completion::Applied(()))
            }
            Err(err) => {
                warn!("Subscribing to {} failed: {}", target.characteristic, err);
                state.transactions.monitor = MonitorState::NotSubscribed;
                self.publish(SessionUpdate::Monitoring(false));
                Err(SessionError::SubscriptionFailed(err))
            }
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.stop_scan_locked(&mut state);
        if let Ok(id) = state.connection.begin_disconnect() {
            self.platform.disconnect(&id);
            state.connection.finish_disconnect();
            self.after_disconnect(&mut state, &id);
        }
        state.connection.abandon();
    }
}

#[async_trait]
impl BleEventHandler for SessionInner {
    async fn on_adapter_state_changed(&self, adapter: AdapterState) {
        let transition = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let transition = state.scan.set_adapter_state(adapter);
            info!("Adapter state: {}", adapter);
            self.publish(SessionUpdate::AdapterState(adapter));
            if let AdapterTransition::PoweredOff { was_scanning: true } = transition {
                self.publish(SessionUpdate::Scanning(false));
            }
            transition
        };

        if transition == AdapterTransition::PoweredOn && self.config.auto_scan_on_power_on {
            match self.start_scan().await {
                Ok(_) => {}
                Err(SessionError::Busy) => debug!("Not scanning on power on, connection active"),
                Err(err) => warn!("Scan on power on failed: {}", err),
            }
        }
    }

    async fn on_scan_stopped(&self) {
        let mut state = self.state.lock();
        if !state.closed && state.scan.stop() {
            info!("Scan window ended");
            self.publish(SessionUpdate::Scanning(false));
        }
    }

    async fn on_peripheral_discovered(&self, advertisement: RawAdvertisement) {
        let strategy = self.platform.identity_strategy();
        let identity = identity::resolve(strategy, &advertisement);
        if strategy == IdentityStrategy::Opaque && identity.is_degraded() {
            if self.config.warn_on_missing_mac {
                warn!("No MAC address advertised by {}", identity.connection_id);
            } else {
                debug!("No MAC address advertised by {}", identity.connection_id);
            }
        }

        let mut device = DiscoveredDevice::from_advertisement(identity, &advertisement);
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        device.is_connecting = state.connection.state() == ConnectionState::Connecting
            && state.connection.target_id() == Some(device.connection_id.as_str());

        if state.registry.upsert(device) {
            debug!(
                "Discovered {} ({} known)",
                advertisement.id,
                state.registry.len()
            );
        }
        if !state.connection.is_connected() {
            self.publish(SessionUpdate::Devices(state.visible_devices()));
        }
    }

    async fn on_peripheral_connected(&self, id: String) {
        debug!("Platform reports {} connected", id);
    }

    async fn on_peripheral_disconnected(&self, id: String, reason: Option<String>) {
        let mut state = self.state.lock();
        if state.connection.peer_disconnected(&id) {
            match reason {
                Some(reason) => warn!("{} dropped the connection: {}", id, reason),
                None => info!("{} dropped the connection", id),
            }
            self.after_disconnect(&mut state, &id);
        } else {
            self.discard("disconnect");
        }
    }

    async fn on_characteristic_value_updated(
        &self,
        peripheral: String,
        characteristic: Uuid,
        value: Vec<u8>,
    ) {
        let mut state = self.state.lock();
        if state.closed
            || !state.connection.is_connected()
            || state.connection.target_id() != Some(peripheral.as_str())
        {
            self.discard("notification");
            return;
        }
        let fragment = decode_value(&value, self.config.notification_encoding);
        debug!("Notification from {}: {:?}", characteristic, fragment);
        let total = state.transactions.receive.push(fragment);
        self.publish(SessionUpdate::ReceiveBuffer(total));
    }
}

/// The single BLE session of the process.
pub struct Session {
    inner: Arc<SessionInner>,
    bus: Mutex<Option<EventBus>>,
}

impl Session {
    pub fn new(platform: Arc<dyn BlePlatform>, config: SessionConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));
        Self {
            inner: Arc::new(SessionInner {
                platform,
                config,
                state: Mutex::new(SessionState::default()),
                updates,
            }),
            bus: Mutex::new(None),
        }
    }

    /// Start the platform and subscribe to its events.
    pub fn start(&self) -> Result<()> {
        self.inner.state.lock().ensure_open()?;
        let events = self.inner.platform.start()?;
        let handler: Arc<dyn BleEventHandler> = self.inner.clone();
        *self.bus.lock() = Some(EventBus::subscribe(events, handler));
        Ok(())
    }

    /// Unsubscribe from platform events, then drop any connection.
    pub fn shutdown(&self) {
        if let Some(mut bus) = self.bus.lock().take() {
            bus.unsubscribe_all();
        }
        self.inner.shutdown();
    }

    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.updates.subscribe()
    }

    /// Feed one platform event straight to the handlers.
    pub async fn handle_event(&self, event: BleEvent) {
        events::dispatch(self.inner.as_ref(), event).await
    }

    pub async fn start_scan(&self) -> Result<Completion<()>> {
        self.inner.start_scan().await
    }

    pub fn stop_scan(&self) {
        self.inner.stop_scan()
    }

    pub fn enable_bluetooth(&self) {
        self.inner.platform.enable_bluetooth()
    }

    pub async fn connect(&self, id: &str) -> Result<Completion<PeripheralInfo>> {
        self.inner.connect(id).await
    }

    pub fn disconnect(&self) -> Result<()> {
        self.inner.disconnect()
    }

    pub async fn write(
        &self,
        payload: &[u8],
        index: usize,
        mode: WriteMode,
    ) -> Result<Completion<()>> {
        self.inner.write(payload, index, mode).await
    }

    pub async fn read(&self, index: usize) -> Result<Completion<Vec<u8>>> {
        self.inner.read(index).await
    }

    pub async fn subscribe(&self, index: usize) -> Result<Completion<()>> {
        self.inner.subscribe(index).await
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase()
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.inner.state.lock().scan.adapter_state()
    }

    /// The list a UI would render.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.state.lock().visible_devices()
    }

    /// Every device seen so far, connected or not.
    pub fn registry_snapshot(&self) -> Vec<DiscoveredDevice> {
        self.inner.state.lock().registry.snapshot()
    }

    /// Forget discovered devices. A connected peripheral is kept.
    pub fn clear_devices(&self) {
        let mut state = self.inner.state.lock();
        let connected = state.visible_devices();
        state.registry.clear();
        if state.connection.is_connected() {
            for device in connected {
                state.registry.upsert(device);
            }
        }
        self.inner
            .publish(SessionUpdate::Devices(state.visible_devices()));
    }

    pub fn peripheral(&self) -> Option<PeripheralInfo> {
        self.inner.state.lock().connection.peripheral().cloned()
    }

    pub fn characteristics(&self) -> CharacteristicSet {
        self.inner.state.lock().connection.characteristics().clone()
    }

    pub fn receive_buffer(&self) -> String {
        self.inner.state.lock().transactions.receive.contents()
    }

    pub fn last_written(&self) -> Option<Vec<u8>> {
        self.inner.state.lock().transactions.last_written.clone()
    }

    pub fn last_read(&self) -> Option<Vec<u8>> {
        self.inner.state.lock().transactions.last_read.clone()
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.state.lock().transactions.monitor == MonitorState::Subscribed
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
