// De-duplicated registry of discovered peripherals

use std::collections::HashMap;

use serde::Serialize;

use crate::identity::{DeviceIdentity, RawAdvertisement};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub connection_id: String,
    pub mac_address: String,
    pub display_name: String,
    pub is_connecting: bool,
    #[serde(with = "hex_bytes")]
    pub advertisement_payload: Vec<u8>,
}

impl DiscoveredDevice {
    pub fn from_advertisement(identity: DeviceIdentity, adv: &RawAdvertisement) -> Self {
        Self {
            connection_id: identity.connection_id,
            mac_address: identity.mac_address,
            display_name: adv.display_name(),
            is_connecting: false,
            advertisement_payload: adv.payload.clone(),
        }
    }

    /// Matches a user supplied selector against id, MAC or name.
    pub fn matches(&self, selector: &str) -> bool {
        self.connection_id.eq_ignore_ascii_case(selector)
            || (!self.mac_address.is_empty() && self.mac_address.eq_ignore_ascii_case(selector))
            || (!self.display_name.is_empty() && self.display_name == selector)
    }
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }
}

/// Insertion-ordered map of connection id to device; one entry per id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DiscoveredDevice>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new device or overwrite the entry with the same connection id.
    /// Returns true when the device was not seen before.
    pub fn upsert(&mut self, device: DiscoveredDevice) -> bool {
        match self.index.get(&device.connection_id) {
            Some(&slot) => {
                self.devices[slot] = device;
                false
            }
            None => {
                self.index
                    .insert(device.connection_id.clone(), self.devices.len());
                self.devices.push(device);
                true
            }
        }
    }

    /// First-seen ordered copy of every device.
    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }

    pub fn get(&self, connection_id: &str) -> Option<&DiscoveredDevice> {
        self.index.get(connection_id).map(|&slot| &self.devices[slot])
    }

    /// Flip the "connecting" marker. Returns false for unknown ids.
    pub fn set_connecting(&mut self, connection_id: &str, connecting: bool) -> bool {
        match self.index.get(connection_id) {
            Some(&slot) => {
                self.devices[slot].is_connecting = connecting;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, name: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            connection_id: id.to_string(),
            mac_address: id.to_string(),
            display_name: name.to_string(),
            is_connecting: false,
            advertisement_payload: Vec::new(),
        }
    }

    #[test]
    fn test_repeated_ids_keep_first_seen_order_and_last_fields() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.upsert(device("AA:BB", "first")));
        assert!(!registry.upsert(device("AA:BB", "second")));
        assert!(registry.upsert(device("CC:DD", "other")));

        let snapshot = registry.snapshot();
        let ids: Vec<_> = snapshot.iter().map(|d| d.connection_id.as_str()).collect();
        assert_eq!(ids, ["AA:BB", "CC:DD"]);
        assert_eq!(snapshot[0].display_name, "second");
    }

    #[test]
    fn test_many_duplicates_collapse() {
        let mut registry = DeviceRegistry::new();
        let ids = ["a", "b", "a", "c", "b", "a", "c"];
        for (n, id) in ids.iter().enumerate() {
            registry.upsert(device(id, &n.to_string()));
        }

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("a").map(|d| d.display_name.as_str()), Some("5"));
        assert_eq!(registry.get("b").map(|d| d.display_name.as_str()), Some("4"));
        assert_eq!(registry.get("c").map(|d| d.display_name.as_str()), Some("6"));
    }

    #[test]
    fn test_snapshot_does_not_alias_storage() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(device("AA:BB", "name"));

        let mut snapshot = registry.snapshot();
        snapshot[0].display_name = "changed".to_string();
        snapshot.clear();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("AA:BB").map(|d| d.display_name.as_str()), Some("name"));
    }

    #[test]
    fn test_set_connecting() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(device("AA:BB", "name"));

        assert!(registry.set_connecting("AA:BB", true));
        assert!(registry.get("AA:BB").map(|d| d.is_connecting).unwrap_or(false));
        assert!(!registry.set_connecting("missing", true));
    }

    #[test]
    fn test_clear() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(device("AA:BB", "name"));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.upsert(device("AA:BB", "name")));
    }

    #[test]
    fn test_matches_selector() {
        let d = DiscoveredDevice {
            mac_address: "11:22:33:44:55:66".to_string(),
            ..device("opaque-id", "Thermo")
        };
        assert!(d.matches("opaque-id"));
        assert!(d.matches("11:22:33:44:55:66"));
        assert!(d.matches("Thermo"));
        assert!(!d.matches("thermo"));
        assert!(!d.matches(""));
    }
}
