// Platform event routing

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::identity::RawAdvertisement;
use crate::scan::AdapterState;

pub type EventSender = mpsc::UnboundedSender<BleEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BleEvent>;

/// Events the platform BLE stack pushes to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    AdapterStateChanged(AdapterState),
    ScanStopped,
    PeripheralDiscovered(RawAdvertisement),
    PeripheralConnected {
        id: String,
    },
    PeripheralDisconnected {
        id: String,
        reason: Option<String>,
    },
    CharacteristicValueUpdated {
        peripheral: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl BleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BleEvent::AdapterStateChanged(_) => EventKind::AdapterStateChanged,
            BleEvent::ScanStopped => EventKind::ScanStopped,
            BleEvent::PeripheralDiscovered(_) => EventKind::PeripheralDiscovered,
            BleEvent::PeripheralConnected { .. } => EventKind::PeripheralConnected,
            BleEvent::PeripheralDisconnected { .. } => EventKind::PeripheralDisconnected,
            BleEvent::CharacteristicValueUpdated { .. } => EventKind::CharacteristicValueUpdated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AdapterStateChanged,
    ScanStopped,
    PeripheralDiscovered,
    PeripheralConnected,
    PeripheralDisconnected,
    CharacteristicValueUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::AdapterStateChanged,
        EventKind::ScanStopped,
        EventKind::PeripheralDiscovered,
        EventKind::PeripheralConnected,
        EventKind::PeripheralDisconnected,
        EventKind::CharacteristicValueUpdated,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::AdapterStateChanged => "adapter-state-changed",
            EventKind::ScanStopped => "scan-stopped",
            EventKind::PeripheralDiscovered => "peripheral-discovered",
            EventKind::PeripheralConnected => "peripheral-connected",
            EventKind::PeripheralDisconnected => "peripheral-disconnected",
            EventKind::CharacteristicValueUpdated => "characteristic-value-updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One method per event kind.
#[async_trait]
pub trait BleEventHandler: Send + Sync {
    async fn on_adapter_state_changed(&self, state: AdapterState);

    async fn on_scan_stopped(&self);

    async fn on_peripheral_discovered(&self, advertisement: RawAdvertisement);

    async fn on_peripheral_connected(&self, id: String);

    async fn on_peripheral_disconnected(&self, id: String, reason: Option<String>);

    async fn on_characteristic_value_updated(
        &self,
        peripheral: String,
        characteristic: Uuid,
        value: Vec<u8>,
    );
}

/// Route one event to its handler method.
pub async fn dispatch(handler: &dyn BleEventHandler, event: BleEvent) {
    match event {
        BleEvent::AdapterStateChanged(state) => handler.on_adapter_state_changed(state).await,
        BleEvent::ScanStopped => handler.on_scan_stopped().await,
        BleEvent::PeripheralDiscovered(adv) => handler.on_peripheral_discovered(adv).await,
        BleEvent::PeripheralConnected { id } => handler.on_peripheral_connected(id).await,
        BleEvent::PeripheralDisconnected { id, reason } => {
            handler.on_peripheral_disconnected(id, reason).await
        }
        BleEvent::CharacteristicValueUpdated {
            peripheral,
            characteristic,
            value,
        } => {
            handler
                .on_characteristic_value_updated(peripheral, characteristic, value)
                .await
        }
    }
}

struct DispatchTable {
    handler: Arc<dyn BleEventHandler>,
    kinds: HashSet<EventKind>,
}

/// Pumps platform events, in arrival order, into a handler until torn down.
pub struct EventBus {
    table: Arc<Mutex<Option<DispatchTable>>>,
    pump: Option<JoinHandle<()>>,
}

impl EventBus {
    /// Subscribe `handler` to all six event kinds.
    pub fn subscribe(mut events: EventReceiver, handler: Arc<dyn BleEventHandler>) -> Self {
        let table = Arc::new(Mutex::new(Some(DispatchTable {
            handler,
            kinds: EventKind::ALL.into_iter().collect(),
        })));

        let pump_table = Arc::clone(&table);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let kind = event.kind();
                let handler = pump_table
                    .lock()
                    .as_ref()
                    .filter(|t| t.kinds.contains(&kind))
                    .map(|t| Arc::clone(&t.handler));

                match handler {
                    Some(handler) => dispatch(handler.as_ref(), event).await,
                    None => debug!("No subscriber for {} event, dropping", kind),
                }
            }
            debug!("Platform event stream closed");
        });

        info!("Subscribed to {} platform events", EventKind::ALL.len());
        Self {
            table,
            pump: Some(pump),
        }
    }

    #[cfg(test)]
    pub fn subscribed(&self) -> Vec<EventKind> {
        match self.table.lock().as_ref() {
            Some(table) => EventKind::ALL
                .into_iter()
                .filter(|k| table.kinds.contains(k))
                .collect(),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.table.lock().is_some()
    }

    /// Drop every subscription at once and stop the pump. Returns how many
    /// subscriptions were removed.
    pub fn unsubscribe_all(&mut self) -> usize {
        let removed = self
            .table
            .lock()
            .take()
            .map(|t| t.kinds.len())
            .unwrap_or(0);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if removed > 0 {
            info!("Unsubscribed from {} platform events", removed);
        }
        removed
    }

    /// Wait for the event stream to end on its own.
    #[cfg(test)]
    pub async fn drained(mut self) {
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
