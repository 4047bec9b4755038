//! Hardware seams of the role engines
//! A link performs radio operations and reports their outcome as events on the
//! channel handed out when it was created. Engines own the receiving end and
//! never assume an operation finished just because the call returned.

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ble_config::AdvertiseSetting;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::CccdValue;
use crate::core::bluetooth::types::{CharacteristicPath, ConnectionHandle, GattService, GattStatus};

/// Link-level connection state carried by `CentralEvent::ConnectionStateChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Events raised by a central link.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    ScanResult {
        address: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    ScanFailed {
        reason: String,
    },
    ConnectionStateChanged {
        address: String,
        status: GattStatus,
        state: LinkState,
        handle: Option<ConnectionHandle>,
    },
    ServicesDiscovered {
        address: String,
        status: GattStatus,
        services: Vec<GattService>,
    },
    Notification {
        path: CharacteristicPath,
        value: Vec<u8>,
    },
}

/// Radio operations of the central role.
#[async_trait]
pub trait CentralLink: Send + Sync {
    async fn start_scan(&self) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Starts a connection attempt. The outcome arrives as `ConnectionStateChanged`.
    async fn connect(&self, address: &str) -> Result<(), BleError>;

    /// Requests a disconnect. The outcome arrives as `ConnectionStateChanged`.
    async fn disconnect(&self, address: &str) -> Result<(), BleError>;

    /// Starts service discovery. The outcome arrives as `ServicesDiscovered`.
    async fn discover_services(&self, address: &str) -> Result<(), BleError>;

    /// Writes `value` to the CCCD of `path` and waits for the confirmation.
    async fn write_descriptor(&self, path: &CharacteristicPath, value: CccdValue) -> Result<(), BleError>;

    async fn write_without_response(&self, path: &CharacteristicPath, data: &[u8]) -> Result<(), BleError>;

    /// Releases every resource held for `address`.
    async fn release(&self, address: &str);
}

/// Status sent back for a write request that asked for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResponse {
    Success,
    WriteNotPermitted,
}

/// Events raised by a peripheral link.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    PeerConnected {
        address: String,
        name: Option<String>,
    },
    PeerDisconnected {
        address: String,
    },
    WriteRequest {
        address: String,
        request_id: u64,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
    DescriptorWriteRequest {
        address: String,
        request_id: u64,
        descriptor: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
    AdvertiseStarted {
        setting: AdvertiseSetting,
    },
    AdvertiseFailed {
        reason: String,
    },
}

/// Radio operations of the peripheral role.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    /// Registers `services` with the local GATT server.
    async fn open_server(&self, services: &[GattService]) -> Result<(), BleError>;

    async fn close_server(&self) -> Result<(), BleError>;

    /// Forces the connection to `address` down.
    async fn cancel_connection(&self, address: &str) -> Result<(), BleError>;

    /// Starts advertising `service`. The outcome arrives as an advertise event.
    async fn start_advertising(&self, setting: &AdvertiseSetting, service: Uuid) -> Result<(), BleError>;

    async fn stop_advertising(&self) -> Result<(), BleError>;

    async fn send_response(&self, address: &str, request_id: u64, response: WriteResponse) -> Result<(), BleError>;

    /// Notifies `value` on `characteristic` to each of `peers`, one result per peer.
    async fn notify(
        &self,
        peers: &[String],
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<(String, Result<(), BleError>)>;
}
