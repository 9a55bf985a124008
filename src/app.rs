// Headless driver standing in for the UI: reacts to session updates

use anyhow::Context;
use log::{debug, info, warn};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::error::SessionError;
use crate::payload;
use crate::registry::DiscoveredDevice;
use crate::scan::AdapterState;
use crate::session::{Completion, Session, SessionPhase, SessionUpdate};
use crate::transaction::{CharacteristicKind, WriteMode};

pub struct Driver<'a> {
    session: &'a Session,
    config: &'a Config,
    payload: Option<Vec<u8>>,
    attempted: bool,
}

impl<'a> Driver<'a> {
    pub fn new(session: &'a Session, config: &'a Config, payload: Option<Vec<u8>>) -> Self {
        Self {
            session,
            config,
            payload,
            attempted: false,
        }
    }

    pub async fn handle(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::AdapterState(AdapterState::On) => {}
            SessionUpdate::AdapterState(state) => {
                warn!("Bluetooth is {}", state);
                if state == AdapterState::Off && self.config.bluetooth.power_on {
                    self.session.enable_bluetooth();
                }
            }
            SessionUpdate::Scanning(scanning) => {
                debug!("Scanning: {}", scanning);
                if !scanning && self.waiting_for_target() {
                    report("scan", self.session.start_scan().await);
                }
            }
            SessionUpdate::Devices(devices) => {
                match serde_json::to_string(&devices) {
                    Ok(json) => debug!("Devices: {}", json),
                    Err(e) => warn!("Cannot render device list: {}", e),
                }
                if let Some(device) = self.pick_target(&devices) {
                    self.connect(&device.connection_id).await;
                }
            }
            SessionUpdate::Connected(peripheral) => {
                let characteristics = self.session.characteristics();
                for kind in [
                    CharacteristicKind::WriteWithResponse,
                    CharacteristicKind::WriteWithoutResponse,
                    CharacteristicKind::Read,
                    CharacteristicKind::Notify,
                ] {
                    if characteristics.offers(kind) {
                        info!(
                            "{} {}: {}",
                            peripheral.id,
                            kind,
                            characteristics.uuids(kind).join(", ")
                        );
                    }
                }
            }
            SessionUpdate::ConnectFailed(id) => warn!("Connect to {} failed", id),
            SessionUpdate::Disconnected(id) => info!("{} disconnected", id),
            SessionUpdate::Written(data) => info!("Sent {} bytes", data.len()),
            SessionUpdate::ReadValue(value) => {
                info!("Read: {} ({})", String::from_utf8_lossy(&value), hex::encode_upper(&value))
            }
            SessionUpdate::Monitoring(on) => info!("Notifications {}", if on { "on" } else { "off" }),
            SessionUpdate::ReceiveBuffer(text) => {
                if !text.is_empty() {
                    info!("Received: {}", text);
                }
            }
        }
    }

    fn waiting_for_target(&self) -> bool {
        self.config.client.target.is_some()
            && !self.attempted
            && self.session.phase() == SessionPhase::Idle
    }

    fn pick_target(&self, devices: &[DiscoveredDevice]) -> Option<DiscoveredDevice> {
        if self.attempted || self.session.phase() == SessionPhase::Connected {
            return None;
        }
        let target = self.config.client.target.as_deref()?;
        devices.iter().find(|d| d.matches(target)).cloned()
    }

    async fn connect(&mut self, id: &str) {
        self.attempted = true;
        match self.session.connect(id).await {
            Ok(Completion::Applied(_)) => self.transact().await,
            Ok(Completion::Discarded) => {}
            Err(SessionError::Busy) => {
                // Someone else holds the slot; try again on the next list.
                self.attempted = false;
            }
            Err(e) => warn!("Connect to {} failed: {}", id, e),
        }
    }

    /// The post-connect transactions the configuration asks for.
    async fn transact(&self) {
        let client = &self.config.client;
        let characteristics = self.session.characteristics();

        if client.subscribe_after_connect && characteristics.offers(CharacteristicKind::Notify) {
            report("subscribe", self.session.subscribe(0).await);
        }

        if let Some(payload) = &self.payload {
            let mode = if client.write_without_response {
                WriteMode::WithoutResponse
            } else {
                WriteMode::WithResponse
            };
            if characteristics.offers(mode.kind()) {
                report("write", self.session.write(payload, 0, mode).await);
            } else {
                warn!("Peripheral offers no {} characteristic", mode.kind());
            }
        }

        if client.read_after_connect && characteristics.offers(CharacteristicKind::Read) {
            report("read", self.session.read(0).await);
        }
    }
}

fn report<T>(what: &str, result: Result<Completion<T>, SessionError>) {
    match result {
        Ok(Completion::Applied(_)) => debug!("{} done", what),
        Ok(Completion::Discarded) => debug!("{} outcome discarded", what),
        Err(e) => warn!("{} failed: {}", what, e),
    }
}

/// Run the session until Ctrl-C, then tear it down.
pub async fn run(session: &Session, config: &Config) -> anyhow::Result<()> {
    let payload = payload::configured_payload(&config.client)
        .await
        .context("Failed to load payload")?;

    let mut updates = session.updates();
    session.start().context("Failed to start BLE session")?;
    let mut driver = Driver::new(session, config, payload);

    info!("Setup complete. Waiting for peripherals...");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(update) => driver.handle(update).await,
                Err(RecvError::Lagged(missed)) => warn!("Missed {} session updates", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down...");
    session.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SessionConfig;
    use crate::events::BleEvent;
    use crate::identity::{IdentityStrategy, RawAdvertisement};
    use crate::platform::mock::{Call, MockPlatform, NOTIFY_CHR, READ_CHR, WRITE_CHR};

    fn config(target: &str) -> Config {
        let mut config = Config::default();
        config.client.target = Some(target.to_string());
        config.client.subscribe_after_connect = true;
        config.client.read_after_connect = true;
        config
    }

    async fn drain(driver: &mut Driver<'_>, updates: &mut tokio::sync::broadcast::Receiver<SessionUpdate>) {
        while let Ok(update) = updates.try_recv() {
            driver.handle(update).await;
        }
    }

    #[tokio::test]
    async fn test_connects_to_target_and_transacts() {
        let platform = Arc::new(MockPlatform::new(IdentityStrategy::MacAddressed));
        let session = Session::new(platform.clone(), SessionConfig::default());
        let config = config("Sensor");
        let mut updates = session.updates();
        let mut driver = Driver::new(&session, &config, Some(b"ping".to_vec()));

        session
            .handle_event(BleEvent::AdapterStateChanged(AdapterState::On))
            .await;
        session
            .handle_event(BleEvent::PeripheralDiscovered(
                RawAdvertisement::new("CC:DD").with_local_name("Other"),
            ))
            .await;
        session
            .handle_event(BleEvent::PeripheralDiscovered(
                RawAdvertisement::new("AA:BB").with_local_name("Sensor"),
            ))
            .await;
        drain(&mut driver, &mut updates).await;

        assert_eq!(session.phase(), SessionPhase::Connected);
        assert_eq!(
            platform.calls(),
            vec![
                Call::Scan,
                Call::StopScan,
                Call::Connect("AA:BB".into()),
                Call::StartNotification(NOTIFY_CHR),
                Call::Write(WRITE_CHR, b"ping".to_vec()),
                Call::Read(READ_CHR),
            ]
        );
        assert_eq!(session.last_written(), Some(b"ping".to_vec()));
    }

    #[tokio::test]
    async fn test_ignores_devices_without_target() {
        let platform = Arc::new(MockPlatform::new(IdentityStrategy::MacAddressed));
        let session = Session::new(platform.clone(), SessionConfig::default());
        let config = Config::default();
        let mut updates = session.updates();
        let mut driver = Driver::new(&session, &config, None);

        session
            .handle_event(BleEvent::AdapterStateChanged(AdapterState::On))
            .await;
        session
            .handle_event(BleEvent::PeripheralDiscovered(RawAdvertisement::new("AA:BB")))
            .await;
        drain(&mut driver, &mut updates).await;

        assert_eq!(session.phase(), SessionPhase::Scanning);
        assert_eq!(platform.calls(), vec![Call::Scan]);
    }

    #[tokio::test]
    async fn test_powers_adapter_on_when_off() {
        let platform = Arc::new(MockPlatform::new(IdentityStrategy::MacAddressed));
        let session = Session::new(platform.clone(), SessionConfig::default());
        let config = Config::default();
        let mut driver = Driver::new(&session, &config, None);

        driver
            .handle(SessionUpdate::AdapterState(AdapterState::Off))
            .await;
        assert_eq!(platform.calls(), vec![Call::EnableBluetooth]);
    }
}
