//! Defines shared data structures for the Bluetooth module.

use serde::Serialize;
use std::fmt;
use std::ops::BitOr;
use uuid::Uuid;

use crate::config::ble_config::AdvertiseSetting;
use crate::core::bluetooth::constants::UUID_CCCD;

/// Opaque identifier of a live link-level connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionHandle(pub u64);

/// Where a peer is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionPhase {
    #[default]
    Discovered,
    Connecting,
    Connected,
    ServicesDiscovered,
    Disconnected,
}

impl ConnectionPhase {
    /// True for the phases that make up the "connected" partition.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionPhase::Connected | ConnectionPhase::ServicesDiscovered)
    }

    /// True while a connection attempt or a connection is in progress.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Connecting
                | ConnectionPhase::Connected
                | ConnectionPhase::ServicesDiscovered
        )
    }
}

/// Result reported by the link for connection and discovery callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GattStatus {
    Success,
    Failure(String),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => write!(f, "GATT_SUCCESS"),
            GattStatus::Failure(reason) => write!(f, "GATT_FAILURE ({})", reason),
        }
    }
}

/// Why the last connection of a device ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    /// The local side asked for the disconnect.
    Requested,
    /// The link dropped without being asked to.
    Unexpected,
    /// The connection attempt or the link reported an error status.
    Failed(GattStatus),
}

/// GATT characteristic properties as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const READ: Capabilities = Capabilities(1 << 0);
    pub const WRITE: Capabilities = Capabilities(1 << 1);
    pub const WRITE_NO_RESPONSE: Capabilities = Capabilities(1 << 2);
    pub const NOTIFY: Capabilities = Capabilities(1 << 3);
    pub const INDICATE: Capabilities = Capabilities(1 << 4);
    pub const SIGNED_WRITE: Capabilities = Capabilities(1 << 5);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Capabilities, &str); 6] = [
            (Capabilities::READ, "READ"),
            (Capabilities::WRITE, "WRITE"),
            (Capabilities::WRITE_NO_RESPONSE, "WRITE_NO_RESPONSE"),
            (Capabilities::NOTIFY, "NOTIFY"),
            (Capabilities::INDICATE, "INDICATE"),
            (Capabilities::SIGNED_WRITE, "SIGNED_WRITE"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// A descriptor of a discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

/// A characteristic of a discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub capabilities: Capabilities,
    pub descriptors: Vec<GattDescriptor>,
    /// Whether this characteristic is routed through the bridge.
    pub selected: bool,
}

impl GattCharacteristic {
    pub fn new(service_uuid: Uuid, uuid: Uuid, capabilities: Capabilities) -> Self {
        Self {
            uuid,
            service_uuid,
            capabilities,
            descriptors: Vec::new(),
            selected: false,
        }
    }

    /// Adds a descriptor owned by this characteristic.
    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(GattDescriptor {
            uuid,
            characteristic_uuid: self.uuid,
        });
        self
    }

    pub fn cccd(&self) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == UUID_CCCD)
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub is_primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Represents a remote peer known to one of the role engines
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerDevice {
    /// The hardware address, the identity of the peer
    pub address: String,
    /// The name of the device, `Unknown` when none was advertised
    pub name: String,
    /// The signal strength of the most recent advertisement
    pub rssi: Option<i16>,
    pub phase: ConnectionPhase,
    /// Present only while a connection is live
    pub handle: Option<ConnectionHandle>,
    /// Services discovered on the last successful connection
    pub services: Vec<GattService>,
    pub last_disconnect: Option<DisconnectReason>,
}

impl PeerDevice {
    /// Creates a freshly discovered device
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            rssi: None,
            phase: ConnectionPhase::Discovered,
            handle: None,
            services: Vec::new(),
            last_disconnect: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase.is_connected()
    }

    pub fn service(&self, uuid: Uuid) -> Option<&GattService> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&GattCharacteristic> {
        self.service(service)?.characteristic(characteristic)
    }

    pub fn characteristic_mut(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<&mut GattCharacteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == characteristic)
    }
}

/// Identifies a characteristic on a specific peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CharacteristicPath {
    pub address: String,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicPath {
    pub fn new(address: impl Into<String>, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            address: address.into(),
            service,
            characteristic,
        }
    }

    /// Path of `characteristic` on `device`.
    pub fn of(device: &PeerDevice, characteristic: &GattCharacteristic) -> Self {
        Self::new(device.address.clone(), characteristic.service_uuid, characteristic.uuid)
    }
}

impl fmt::Display for CharacteristicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.address, self.service, self.characteristic)
    }
}

/// Scanning state of the central role
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum ScanState {
    Started,
    #[default]
    Stopped,
}

/// State of the GATT server hosted by the peripheral role
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum GattServerState {
    Open,
    #[default]
    Closed,
    Error(String),
}

/// Advertising state of the peripheral role
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum AdvertiseState {
    Started(AdvertiseSetting),
    #[default]
    Stopped,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_contains_only_set_bits() {
        let caps = Capabilities::NOTIFY | Capabilities::WRITE_NO_RESPONSE;
        assert!(caps.contains(Capabilities::NOTIFY));
        assert!(caps.contains(Capabilities::WRITE_NO_RESPONSE));
        assert!(!caps.contains(Capabilities::INDICATE));
        assert!(caps.contains(Capabilities::NONE));
        assert_eq!(caps.to_string(), "[WRITE_NO_RESPONSE, NOTIFY]");
    }

    #[test]
    fn test_connected_partition_phases() {
        assert!(ConnectionPhase::Connected.is_connected());
        assert!(ConnectionPhase::ServicesDiscovered.is_connected());
        assert!(!ConnectionPhase::Connecting.is_connected());
        assert!(ConnectionPhase::Connecting.is_busy());
        assert!(!ConnectionPhase::Disconnected.is_busy());
    }

    #[test]
    fn test_characteristic_lookup_on_device() {
        let service = Uuid::from_u128(0x180d);
        let chr = Uuid::from_u128(0x2a37);
        let mut device = PeerDevice::new("AA:BB:CC:DD:EE:FF", "HRM");
        device.services.push(GattService {
            uuid: service,
            is_primary: true,
            characteristics: vec![
                GattCharacteristic::new(service, chr, Capabilities::NOTIFY).with_descriptor(UUID_CCCD),
            ],
        });

        let found = device.characteristic(service, chr).map(|c| c.cccd().is_some());
        assert_eq!(found, Some(true));
        assert!(device.characteristic(service, Uuid::from_u128(0x2a38)).is_none());

        if let Some(c) = device.characteristic_mut(service, chr) {
            c.selected = true;
        }
        assert!(device.characteristic(service, chr).is_some_and(|c| c.selected));
    }
}
