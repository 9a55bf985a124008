// In-memory platform used by the session tests

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::BlePlatform;
use crate::connection::PeripheralInfo;
use crate::error::PlatformError;
use crate::events::{BleEvent, EventReceiver, EventSender};
use crate::identity::IdentityStrategy;
use crate::transaction::{CharacteristicProperties, CharacteristicRef, DiscoveredCharacteristic};

pub const SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const WRITE_CHR: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const WRITE_NR_CHR: Uuid = Uuid::from_u128(0x6e400004_b5a3_f393_e0a9_e50e24dcca9e);
pub const READ_CHR: Uuid = Uuid::from_u128(0x6e400005_b5a3_f393_e0a9_e50e24dcca9e);
pub const NOTIFY_CHR: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Scan,
    StopScan,
    CheckState,
    EnableBluetooth,
    Connect(String),
    Disconnect(String),
    Write(Uuid, Vec<u8>),
    WriteWithoutResponse(Uuid, Vec<u8>),
    Read(Uuid),
    StartNotification(Uuid),
}

pub fn sample_characteristics() -> Vec<DiscoveredCharacteristic> {
    let chr = |characteristic, properties| DiscoveredCharacteristic {
        target: CharacteristicRef {
            service: SERVICE,
            characteristic,
        },
        properties,
    };
    vec![
        chr(
            WRITE_CHR,
            CharacteristicProperties {
                write: true,
                ..Default::default()
            },
        ),
        chr(
            WRITE_NR_CHR,
            CharacteristicProperties {
                write_without_response: true,
                ..Default::default()
            },
        ),
        chr(
            READ_CHR,
            CharacteristicProperties {
                read: true,
                ..Default::default()
            },
        ),
        chr(
            NOTIFY_CHR,
            CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
        ),
    ]
}

pub struct MockPlatform {
    strategy: IdentityStrategy,
    events_tx: EventSender,
    events_rx: Mutex<Option<EventReceiver>>,
    calls: Mutex<Vec<Call>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    scan_error: Mutex<Option<PlatformError>>,
    connect_error: Mutex<Option<PlatformError>>,
    write_error: Mutex<Option<PlatformError>>,
    read_error: Mutex<Option<PlatformError>>,
    notify_error: Mutex<Option<PlatformError>>,
    read_value: Mutex<Vec<u8>>,
}

impl MockPlatform {
    pub fn new(strategy: IdentityStrategy) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            strategy,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            scan_error: Mutex::new(None),
            connect_error: Mutex::new(None),
            write_error: Mutex::new(None),
            read_error: Mutex::new(None),
            notify_error: Mutex::new(None),
            read_value: Mutex::new(b"value".to_vec()),
        }
    }

    /// Feed an event as if the stack had emitted it.
    pub fn emit(&self, event: BleEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Hold the next suspending call until the returned sender fires.
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    pub fn fail_scan(&self, err: PlatformError) {
        *self.scan_error.lock() = Some(err);
    }

    pub fn fail_connect(&self, err: PlatformError) {
        *self.connect_error.lock() = Some(err);
    }

    pub fn fail_write(&self, err: PlatformError) {
        *self.write_error.lock() = Some(err);
    }

    pub fn fail_read(&self, err: PlatformError) {
        *self.read_error.lock() = Some(err);
    }

    pub fn fail_notify(&self, err: PlatformError) {
        *self.notify_error.lock() = Some(err);
    }

    pub fn set_read_value(&self, value: &[u8]) {
        *self.read_value.lock() = value.to_vec();
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
    }

    fn outcome(slot: &Mutex<Option<PlatformError>>) -> Result<(), PlatformError> {
        match slot.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    fn identity_strategy(&self) -> IdentityStrategy {
        self.strategy
    }

    fn start(&self) -> Result<EventReceiver, PlatformError> {
        self.events_rx
            .lock()
            .take()
            .ok_or(PlatformError::EventStreamTaken)
    }

    async fn scan(&self) -> Result<(), PlatformError> {
        self.record(Call::Scan);
        self.pass_gate().await;
        Self::outcome(&self.scan_error)
    }

    fn stop_scan(&self) {
        self.record(Call::StopScan);
    }

    fn check_state(&self) {
        self.record(Call::CheckState);
    }

    fn enable_bluetooth(&self) {
        self.record(Call::EnableBluetooth);
    }

    async fn connect(&self, id: &str) -> Result<PeripheralInfo, PlatformError> {
        self.record(Call::Connect(id.to_string()));
        self.pass_gate().await;
        Self::outcome(&self.connect_error)?;
        Ok(PeripheralInfo {
            id: id.to_string(),
            name: Some("Mock".to_string()),
            characteristics: sample_characteristics(),
        })
    }

    fn disconnect(&self, id: &str) {
        self.record(Call::Disconnect(id.to_string()));
    }

    async fn write(
        &self,
        _id: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        self.record(Call::Write(characteristic.characteristic, data.to_vec()));
        self.pass_gate().await;
        Self::outcome(&self.write_error)
    }

    async fn write_without_response(
        &self,
        _id: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<(), PlatformError> {
        self.record(Call::WriteWithoutResponse(
            characteristic.characteristic,
            data.to_vec(),
        ));
        self.pass_gate().await;
        Self::outcome(&self.write_error)
    }

    async fn read(
        &self,
        _id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>, PlatformError> {
        self.record(Call::Read(characteristic.characteristic));
        self.pass_gate().await;
        Self::outcome(&self.read_error)?;
        Ok(self.read_value.lock().clone())
    }

    async fn start_notification(
        &self,
        _id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<(), PlatformError> {
        self.record(Call::StartNotification(characteristic.characteristic));
        self.pass_gate().await;
        Self::outcome(&self.notify_error)
    }
}
