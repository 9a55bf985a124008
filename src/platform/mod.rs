// Capability contract of the platform BLE stack

use async_trait::async_trait;

use crate::connection::PeripheralInfo;
use crate::error::PlatformError;
use crate::events::EventReceiver;
use crate::identity::IdentityStrategy;
use crate::transaction::CharacteristicRef;

#[cfg(test)]
pub mod mock;

/// Operations the session needs from the platform.
///
/// Scan start, connect, the two writes, read and notification start may
/// suspend; each resolves exactly once. Everything else returns immediately
/// and reports back, if at all, through the event stream.
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// How this platform names peripherals.
    fn identity_strategy(&self) -> IdentityStrategy;

    /// Initialise the stack and hand over its event stream. Can only be
    /// called once.
    fn start(&self) -> Result<EventReceiver, PlatformError>;

    async fn scan(&self) -> Result<(), PlatformError>;

    fn stop_scan(&self);

    /// Ask the stack to re-emit its adapter state.
    fn check_state(&self);

    fn enable_bluetooth(&self);

    async fn connect(&self, id: &str) -> Result<PeripheralInfo, PlatformError>;

    fn disconnect(&self, id: &str);

    async fn write(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<(), PlatformError>;

    async fn write_without_response(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<(), PlatformError>;

    async fn read(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>, PlatformError>;

    async fn start_notification(
        &self,
        id: &str,
        characteristic: &CharacteristicRef,
    ) -> Result<(), PlatformError>;
}
