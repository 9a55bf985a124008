// Scan lifecycle and adapter power tracking

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Power state reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    #[default]
    Unknown,
    On,
    Off,
    Unauthorized,
    Unsupported,
}

impl AdapterState {
    pub fn is_on(self) -> bool {
        self == AdapterState::On
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::On => "on",
            AdapterState::Off => "off",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Stopped,
    Scanning,
}

/// What an adapter state change asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterTransition {
    PoweredOn,
    PoweredOff { was_scanning: bool },
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ScanController {
    state: ScanState,
    adapter: AdapterState,
    /// Bumped on every stop so a slow scan start can tell it lost the race.
    generation: u64,
}

impl ScanController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.state == ScanState::Scanning
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter
    }

    pub fn set_adapter_state(&mut self, adapter: AdapterState) -> AdapterTransition {
        let previous = std::mem::replace(&mut self.adapter, adapter);
        if adapter.is_on() {
            if previous.is_on() {
                AdapterTransition::Unchanged
            } else {
                AdapterTransition::PoweredOn
            }
        } else {
            let was_scanning = self.stop();
            if previous.is_on() || was_scanning {
                AdapterTransition::PoweredOff { was_scanning }
            } else {
                AdapterTransition::Unchanged
            }
        }
    }

    /// Check a scan may start; returns the generation the start belongs to.
    pub fn begin_start(&self) -> Result<u64> {
        if !self.adapter.is_on() {
            return Err(SessionError::AdapterUnavailable);
        }
        Ok(self.generation)
    }

    /// Record a successful platform scan start. Returns false when a stop or
    /// power-off happened while the start was pending.
    pub fn finish_start(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.adapter.is_on() {
            return false;
        }
        self.state = ScanState::Scanning;
        true
    }

    /// Stop scanning. Idempotent; returns whether a scan was running.
    pub fn stop(&mut self) -> bool {
        self.generation += 1;
        std::mem::replace(&mut self.state, ScanState::Stopped) == ScanState::Scanning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn powered() -> ScanController {
        let mut scan = ScanController::new();
        assert_eq!(scan.set_adapter_state(AdapterState::On), AdapterTransition::PoweredOn);
        scan
    }

    #[test]
    fn test_start_requires_adapter_on() {
        let scan = ScanController::new();
        assert_eq!(scan.begin_start(), Err(SessionError::AdapterUnavailable));
        assert_eq!(scan.state(), ScanState::Stopped);
    }

    #[test]
    fn test_start_and_stop() {
        let mut scan = powered();
        let generation = scan.begin_start().unwrap();
        assert!(scan.finish_start(generation));
        assert!(scan.is_scanning());

        assert!(scan.stop());
        assert!(!scan.stop());
        assert_eq!(scan.state(), ScanState::Stopped);
    }

    #[test]
    fn test_stop_while_start_pending_wins() {
        let mut scan = powered();
        let generation = scan.begin_start().unwrap();
        scan.stop();
        assert!(!scan.finish_start(generation));
        assert!(!scan.is_scanning());
    }

    #[test]
    fn test_power_off_forces_stop() {
        let mut scan = powered();
        let generation = scan.begin_start().unwrap();
        scan.finish_start(generation);

        assert_eq!(
            scan.set_adapter_state(AdapterState::Off),
            AdapterTransition::PoweredOff { was_scanning: true }
        );
        assert_eq!(scan.state(), ScanState::Stopped);
        assert_eq!(scan.begin_start(), Err(SessionError::AdapterUnavailable));

        assert_eq!(scan.set_adapter_state(AdapterState::On), AdapterTransition::PoweredOn);
    }

    #[test]
    fn test_repeated_on_is_unchanged() {
        let mut scan = powered();
        assert_eq!(scan.set_adapter_state(AdapterState::On), AdapterTransition::Unchanged);
    }

    #[test]
    fn test_adapter_state_display() {
        assert_eq!(AdapterState::On.to_string(), "on");
        assert_eq!(AdapterState::Off.to_string(), "off");
    }
}
