// Bluetooth Low Energy platform using bluer crate

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty};
use futures::{pin_mut, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::BluetoothConfig;
use crate::connection::PeripheralInfo;
use crate::error::PlatformError;
use crate::events::{BleEvent, EventReceiver, EventSender};
use crate::identity::{
    self, IdentityStrategy, RawAdvertisement, COMPLETE_LOCAL_NAME_AD_TYPE,
    MANUFACTURER_DATA_AD_TYPE,
};
use crate::platform::BlePlatform;
use crate::scan::AdapterState;
use crate::transaction::{
    CharacteristicProperties, CharacteristicRef, DiscoveredCharacteristic,
};

const SERVICE_DATA_128_AD_TYPE: u8 = 0x21;
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);
const SERVICES_RESOLVE_ATTEMPTS: u32 = 100;

#[derive(Default)]
struct Tasks {
    monitor: Option<JoinHandle<()>>,
    discovery: Option<JoinHandle<()>>,
    device: Option<JoinHandle<()>>,
    notifications: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn replace(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    fn stop_device(&mut self) {
        if let Some(task) = self.device.take() {
            task.abort();
        }
        for task in self.notifications.drain(..) {
            task.abort();
        }
    }

    fn stop_all(&mut self) {
        self.stop_device();
        for task in [self.monitor.take(), self.discovery.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

struct ConnectedPeripheral {
    id: String,
    device: Device,
    characteristics: HashMap<CharacteristicRef, Characteristic>,
}

pub struct BleAdapter {
    _session: bluer::Session,
    adapter: Adapter,
    name: String,
    config: BluetoothConfig,
    events_tx: EventSender,
    events_rx: Mutex<Option<EventReceiver>>,
    tasks: Mutex<Tasks>,
    connected: Mutex<Option<ConnectedPeripheral>>,
}

impl BleAdapter {
    pub async fn new(config: BluetoothConfig) -> Result<Self, PlatformError> {
        let session = bluer::Session::new().await?;
        let adapter = match &config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        let name = adapter.name().to_string();

        info!("Using Bluetooth adapter: {}", name);

        if config.power_on {
            adapter.set_powered(true).await?;
        }
        debug!("Adapter address: {}", adapter.address().await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(BleAdapter {
            _session: session,
            adapter,
            name,
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Tasks::default()),
            connected: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn emit_powered(tx: &EventSender, powered: bool) {
        let state = if powered {
            AdapterState::On
        } else {
            AdapterState::Off
        };
        let _ = tx.send(BleEvent::AdapterStateChanged(state));
    }

    fn characteristic(
        &self,
        id: &str,
        target: &CharacteristicRef,
    ) -> Result<Characteristic, PlatformError> {
        let connected = self.connected.lock();
        let peripheral = connected
            .as_ref()
            .filter(|p| p.id == id)
            .ok_or_else(|| PlatformError::PeripheralNotFound(id.to_string()))?;
        peripheral
            .characteristics
            .get(target)
            .cloned()
            .ok_or_else(|| PlatformError::CharacteristicNotFound(target.characteristic.to_string()))
    }

    async fn wait_for_services(device: &Device) -> Result<(), PlatformError> {
        for _ in 0..SERVICES_RESOLVE_ATTEMPTS {
            if device.is_services_resolved().await? {
                return Ok(());
            }
            tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
        }
        Err(PlatformError::Rejected("services not resolved".to_string()))
    }

    async fn discover_characteristics(
        device: &Device,
    ) -> Result<
        (
            Vec<DiscoveredCharacteristic>,
            HashMap<CharacteristicRef, Characteristic>,
        ),
        PlatformError,
    > {
        let mut discovered = Vec::new();
        let mut handles = HashMap::new();
        for service in device.services().await? {
            let service_uuid = service.uuid().await?;
            for chr in service.characteristics().await? {
                let flags = chr.flags().await?;
                let target = CharacteristicRef {
                    service: service_uuid,
                    characteristic: chr.uuid().await?,
                };
                discovered.push(DiscoveredCharacteristic {
                    target,
                    properties: CharacteristicProperties {
                        read: flags.read,
                        write: flags.write,
                        write_without_response: flags.write_without_response,
                        notify: flags.notify,
                        indicate: flags.indicate,
                    },
                });
                handles.insert(target, chr);
            }
        }
        Ok((discovered, handles))
    }

    async fn write_with(
        &self,
        id: &str,
        target: &CharacteristicRef,
        data: &[u8],
        op_type: WriteOp,
    ) -> Result<(), PlatformError> {
        let chr = self.characteristic(id, target)?;
        let mut request = CharacteristicWriteRequest::default();
        request.op_type = op_type;
        chr.write_ext(data, &request)
            .await
            .map_err(|e| PlatformError::Rejected(e.to_string()))
    }
}

/// Advertisement fields as BlueZ exposes them, before re-encoding.
#[derive(Debug, Default)]
struct AdvertisedFields {
    local_name: Option<String>,
    /// Raw sections BlueZ does not decode itself, keyed by AD type.
    advertising_data: HashMap<u8, Vec<u8>>,
    manufacturer_data: HashMap<u16, Vec<u8>>,
    service_data: HashMap<Uuid, Vec<u8>>,
}

impl AdvertisedFields {
    /// Re-encode as AD sections so the identity resolver works on bytes.
    /// Sections come out sorted by key within each group.
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        if let Some(name) = &self.local_name {
            identity::push_ad_structure(&mut payload, COMPLETE_LOCAL_NAME_AD_TYPE, name.as_bytes());
        }

        let mut raw: Vec<_> = self.advertising_data.iter().collect();
        raw.sort_by_key(|(ad_type, _)| **ad_type);
        for (ad_type, bytes) in raw {
            identity::push_ad_structure(&mut payload, *ad_type, bytes);
        }

        let mut manufacturers: Vec<_> = self.manufacturer_data.iter().collect();
        manufacturers.sort_by_key(|(company, _)| **company);
        for (company, bytes) in manufacturers {
            let mut section = company.to_le_bytes().to_vec();
            section.extend_from_slice(bytes);
            identity::push_ad_structure(&mut payload, MANUFACTURER_DATA_AD_TYPE, &section);
        }

        let mut services: Vec<_> = self.service_data.iter().collect();
        services.sort_by_key(|(uuid, _)| **uuid);
        for (uuid, bytes) in services {
            let mut section = uuid.as_u128().to_le_bytes().to_vec();
            section.extend_from_slice(bytes);
            identity::push_ad_structure(&mut payload, SERVICE_DATA_128_AD_TYPE, &section);
        }
        payload
    }
}

/// Build a discovery record from the device's current properties.
async fn describe(adapter: &Adapter, address: Address) -> Result<RawAdvertisement, PlatformError> {
    let device = adapter.device(address)?;
    let alias = device.alias().await?;
    let fields = AdvertisedFields {
        local_name: device.name().await?,
        advertising_data: device.advertising_data().await?.unwrap_or_default(),
        manufacturer_data: device.manufacturer_data().await?.unwrap_or_default(),
        service_data: device.service_data().await?.unwrap_or_default(),
    };

    let mut adv = RawAdvertisement::new(address.to_string())
        .with_name(alias)
        .with_payload(fields.encode());
    adv.local_name = fields.local_name;
    Ok(adv)
}

#[async_trait]
impl BlePlatform for BleAdapter {
    fn identity_strategy(&self) -> IdentityStrategy {
        self.config.identity
    }

    fn start(&self) -> Result<EventReceiver, PlatformError> {
        let events = self
            .events_rx
            .lock()
            .take()
            .ok_or(PlatformError::EventStreamTaken)?;

        let adapter = self.adapter.clone();
        let tx = self.events_tx.clone();
        let monitor = tokio::spawn(async move {
            match adapter.is_powered().await {
                Ok(powered) => Self::emit_powered(&tx, powered),
                Err(e) => warn!("Cannot read adapter power state: {}", e),
            }
            let changes = match adapter.events().await {
                Ok(changes) => changes,
                Err(e) => {
                    warn!("Cannot watch adapter: {}", e);
                    return;
                }
            };
            pin_mut!(changes);
            while let Some(event) = changes.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    Self::emit_powered(&tx, powered);
                }
            }
        });
        Tasks::replace(&mut self.tasks.lock().monitor, monitor);

        Ok(events)
    }

    async fn scan(&self) -> Result<(), PlatformError> {
        info!("Starting BLE device scan...");
        // Property changes re-send DeviceAdded, so late names and data refresh the entry.
        let discovery = self.adapter.discover_devices_with_changes().await?;

        let adapter = self.adapter.clone();
        let tx = self.events_tx.clone();
        let window = Duration::from_secs(self.config.scan_seconds);
        let task = tokio::spawn(async move {
            pin_mut!(discovery);
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = discovery.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            match describe(&adapter, address).await {
                                Ok(adv) => {
                                    let _ = tx.send(BleEvent::PeripheralDiscovered(adv));
                                }
                                Err(e) => debug!("Skipping {}: {}", address, e),
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            let _ = tx.send(BleEvent::ScanStopped);
        });
        Tasks::replace(&mut self.tasks.lock().discovery, task);
        Ok(())
    }

    fn stop_scan(&self) {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(task) = self.tasks.lock().discovery.take() {
            task.abort();
        }
    }

    fn check_state(&self) {
        let adapter = self.adapter.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            match adapter.is_powered().await {
                Ok(powered) => Self::emit_powered(&tx, powered),
                Err(e) => warn!("Cannot read adapter power state: {}", e),
            }
        });
    }

    fn enable_bluetooth(&self) {
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.set_powered(true).await {
                warn!("Cannot power on adapter: {}", e);
            }
        });
    }

    async fn connect(&self, id: &str) -> Result<PeripheralInfo, PlatformError> {
        info!("Connecting to device: {}", id);
        let address: Address = id
            .parse()
            .map_err(|_| PlatformError::PeripheralNotFound(id.to_string()))?;
        let device = self.adapter.device(address)?;

        if !device.is_connected().await? {
            device
                .connect()
                .await
                .map_err(|e| PlatformError::Rejected(e.to_string()))?;
        }
        Self::wait_for_services(&device).await?;
        let (characteristics, handles) = Self::discover_characteristics(&device).await?;
        let name = device.name().await?;

        let changes = device.events().await?;
        let tx = self.events_tx.clone();
        let peripheral = id.to_string();
        let watcher = tokio::spawn(async move {
            pin_mut!(changes);
            while let Some(DeviceEvent::PropertyChanged(property)) = changes.next().await {
                if let DeviceProperty::Connected(false) = property {
                    let _ = tx.send(BleEvent::PeripheralDisconnected {
                        id: peripheral,
                        reason: None,
                    });
                    break;
                }
            }
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.stop_device();
            tasks.device = Some(watcher);
        }
        *self.connected.lock() = Some(ConnectedPeripheral {
            id: id.to_string(),
            device,
            characteristics: handles,
        });
        let _ = self.events_tx.send(BleEvent::PeripheralConnected { id: id.to_string() });

        Ok(PeripheralInfo {
            id: id.to_string(),
            name,
            characteristics,
        })
    }

    fn disconnect(&self, id: &str) {
        let peripheral = {
            let mut connected = self.connected.lock();
            match connected.as_ref() {
                Some(p) if p.id == id => connected.take(),
                _ => None,
            }
        };
        self.tasks.lock().stop_device();

        if let Some(peripheral) = peripheral {
            info!("Disconnecting from {}", id);
            tokio::spawn(async move {
                if let Err(e) = peripheral.device.disconnect().await {
                    warn!("Disconnect from {} failed: {}", peripheral.id, e);
                }
            });
        }
    }

    async fn write(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        self.write_with(id, characteristic, data, WriteOp::Request)
            .await
    }

    async fn write_without_response(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        self.write_with(id, characteristic, data, WriteOp::Command)
            .await
    }

    async fn read(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>, PlatformError> {
        let chr = self.characteristic(id, characteristic)?;
        chr.read()
            .await
            .map_err(|e| PlatformError::Rejected(e.to_string()))
    }

    async fn start_notification(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<(), PlatformError> {
        let chr = self.characteristic(id, characteristic)?;
        let values = chr
            .notify()
            .await
            .map_err(|e| PlatformError::Rejected(e.to_string()))?;

        let tx = self.events_tx.clone();
        let peripheral = id.to_string();
        let uuid = characteristic.characteristic;
        let task = tokio::spawn(async move {
            pin_mut!(values);
            while let Some(value) = values.next().await {
                let event = BleEvent::CharacteristicValueUpdated {
                    peripheral: peripheral.clone(),
                    characteristic: uuid,
                    value,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            debug!("Notifications from {} ended", uuid);
        });
        self.tasks.lock().notifications.push(task);
        Ok(())
    }
}

impl Drop for BleAdapter {
    fn drop(&mut self) {
        self.tasks.lock().stop_all();
    }
}
