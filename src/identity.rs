// Cross-platform device identity from advertisement records

use serde::{Deserialize, Serialize};

/// AD type carrying the peripheral's MAC address on platforms that hide it.
pub const MAC_ADDRESS_AD_TYPE: u8 = 0x18;

/// AD type for the complete local name.
pub const COMPLETE_LOCAL_NAME_AD_TYPE: u8 = 0x09;

/// AD type for manufacturer specific data.
pub const MANUFACTURER_DATA_AD_TYPE: u8 = 0xff;

const MAC_ADDRESS_LEN: usize = 6;

/// How the platform addresses peripherals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// Connection ids are MAC addresses (BlueZ, Android).
    #[default]
    MacAddressed,
    /// Connection ids are opaque; the MAC has to come from the advertisement.
    Opaque,
}

/// A discovery record as delivered by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub id: String,
    pub name: Option<String>,
    pub local_name: Option<String>,
    pub payload: Vec<u8>,
}

impl RawAdvertisement {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_local_name(mut self, local_name: impl Into<String>) -> Self {
        self.local_name = Some(local_name.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Advertised local name, else device name, else empty.
    pub fn display_name(&self) -> String {
        self.local_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| self.name.as_deref().filter(|n| !n.is_empty()))
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub connection_id: String,
    /// Empty when the MAC could not be recovered.
    pub mac_address: String,
}

impl DeviceIdentity {
    pub fn is_degraded(&self) -> bool {
        self.mac_address.is_empty()
    }
}

/// Resolve the connection id and MAC address of a discovered peripheral.
pub fn resolve(strategy: IdentityStrategy, adv: &RawAdvertisement) -> DeviceIdentity {
    match strategy {
        IdentityStrategy::MacAddressed => DeviceIdentity {
            connection_id: adv.id.clone(),
            mac_address: adv.id.clone(),
        },
        IdentityStrategy::Opaque => DeviceIdentity {
            connection_id: adv.id.clone(),
            mac_address: extract_mac_address(&adv.payload).unwrap_or_default(),
        },
    }
}

/// Pull the MAC address out of the `0x18` section, if present.
///
/// The section stores the address least significant byte first.
pub fn extract_mac_address(payload: &[u8]) -> Option<String> {
    let data = ad_structures(payload)
        .find(|(ad_type, _)| *ad_type == MAC_ADDRESS_AD_TYPE)
        .map(|(_, data)| data)?;

    if data.len() != MAC_ADDRESS_LEN {
        return None;
    }

    let octets: Vec<String> = data.iter().rev().map(|b| format!("{:02X}", b)).collect();
    Some(octets.join(":"))
}

/// Iterate `(type, data)` pairs of a raw advertisement. Stops at the first
/// zero-length or truncated structure.
pub fn ad_structures(payload: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut i = 0;
    std::iter::from_fn(move || {
        let len = *payload.get(i)? as usize;
        if len == 0 || i + len >= payload.len() {
            return None;
        }
        let ad_type = payload[i + 1];
        let data = &payload[i + 2..i + 1 + len];
        i += len + 1;
        Some((ad_type, data))
    })
}

/// Append one AD structure to `buf`. Sections longer than 254 bytes are cut.
pub fn push_ad_structure(buf: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    let data = &data[..data.len().min(u8::MAX as usize - 1)];
    buf.push(data.len() as u8 + 1);
    buf.push(ad_type);
    buf.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_with_mac() -> Vec<u8> {
        let mut payload = Vec::new();
        push_ad_structure(&mut payload, COMPLETE_LOCAL_NAME_AD_TYPE, b"Sensor");
        push_ad_structure(
            &mut payload,
            MAC_ADDRESS_AD_TYPE,
            &[0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa],
        );
        payload
    }

    #[test]
    fn test_mac_addressed_uses_id_for_both() {
        let adv = RawAdvertisement::new("AA:BB:CC:DD:EE:FF");
        let identity = resolve(IdentityStrategy::MacAddressed, &adv);
        assert_eq!(identity.connection_id, "AA:BB:CC:DD:EE:FF");
        assert_eq!(identity.mac_address, "AA:BB:CC:DD:EE:FF");
        assert!(!identity.is_degraded());
    }

    #[test]
    fn test_opaque_extracts_mac_from_payload() {
        let adv = RawAdvertisement::new("5F1C2A44-0B7E-4C55-9E0C-3D1C8B7A6E21")
            .with_payload(payload_with_mac());
        let identity = resolve(IdentityStrategy::Opaque, &adv);
        assert_eq!(identity.connection_id, "5F1C2A44-0B7E-4C55-9E0C-3D1C8B7A6E21");
        assert_eq!(identity.mac_address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_opaque_without_section_is_degraded() {
        let mut payload = Vec::new();
        push_ad_structure(&mut payload, COMPLETE_LOCAL_NAME_AD_TYPE, b"Sensor");
        let adv = RawAdvertisement::new("opaque-1").with_payload(payload);
        let identity = resolve(IdentityStrategy::Opaque, &adv);
        assert_eq!(identity.connection_id, "opaque-1");
        assert!(identity.is_degraded());
    }

    #[test]
    fn test_wrong_length_section_is_ignored() {
        let mut payload = Vec::new();
        push_ad_structure(&mut payload, MAC_ADDRESS_AD_TYPE, &[0x01, 0x02, 0x03]);
        assert_eq!(extract_mac_address(&payload), None);
    }

    #[test]
    fn test_truncated_payload_stops_parsing() {
        // Length byte claims more data than present.
        let payload = [0x07, MAC_ADDRESS_AD_TYPE, 0x01, 0x02];
        assert_eq!(ad_structures(&payload).count(), 0);
        assert_eq!(extract_mac_address(&payload), None);
    }

    #[test]
    fn test_ad_structures_walks_sections() {
        let payload = payload_with_mac();
        let sections: Vec<_> = ad_structures(&payload).collect();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0], (COMPLETE_LOCAL_NAME_AD_TYPE, &b"Sensor"[..]));
        assert_eq!(sections[1].0, MAC_ADDRESS_AD_TYPE);
    }

    #[test]
    fn test_display_name_precedence() {
        let adv = RawAdvertisement::new("id").with_name("Device");
        assert_eq!(adv.display_name(), "Device");

        let adv = adv.with_local_name("Local");
        assert_eq!(adv.display_name(), "Local");

        assert_eq!(RawAdvertisement::new("id").display_name(), "");
    }
}
