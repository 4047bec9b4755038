//! In-memory links
//! Both simulated links are self-driving: operations that would succeed on a
//! radio report success through the event channel right away. Failures are
//! injected explicitly and every outbound operation is recorded, so the same
//! links back the test suite and the binary's `--simulate` mode.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ble_config::AdvertiseSetting;
use crate::core::bluetooth::constants::UUID_CCCD;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::link::{
    CentralEvent, CentralLink, LinkState, PeripheralEvent, PeripheralLink, WriteResponse,
};
use crate::core::bluetooth::notification::CccdValue;
use crate::core::bluetooth::types::{
    Capabilities, CharacteristicPath, ConnectionHandle, GattCharacteristic, GattService, GattStatus,
};
use crate::utils::lock;

/// Heart rate service used by the demo peripheral.
pub const DEMO_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
/// Notify + indicate characteristic of the demo peripheral.
pub const DEMO_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
/// Write-without-response characteristic of the demo peripheral.
pub const DEMO_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

/// Topology of the demo peripheral: one service with a notifiable and a writable characteristic.
pub fn demo_topology() -> Vec<GattService> {
    vec![GattService {
        uuid: DEMO_SERVICE,
        is_primary: true,
        characteristics: vec![
            GattCharacteristic::new(
                DEMO_SERVICE,
                DEMO_NOTIFY_CHAR,
                Capabilities::NOTIFY | Capabilities::INDICATE | Capabilities::READ,
            )
            .with_descriptor(UUID_CCCD),
            GattCharacteristic::new(DEMO_SERVICE, DEMO_WRITE_CHAR, Capabilities::WRITE_NO_RESPONSE),
        ],
    }]
}

#[derive(Debug, Clone)]
struct SimulatedPeer {
    address: String,
    name: Option<String>,
    rssi: Option<i16>,
    services: Vec<GattService>,
}

#[derive(Debug, Default)]
struct CentralState {
    peers: Vec<SimulatedPeer>,
    scanning: bool,
    connected: HashSet<String>,
    subscriptions: HashMap<CharacteristicPath, CccdValue>,
    descriptor_writes: Vec<(CharacteristicPath, CccdValue)>,
    writes: Vec<(CharacteristicPath, Vec<u8>)>,
    refused_connections: HashSet<String>,
    failing_writes: HashSet<String>,
    failing_descriptor_writes: bool,
    scan_failure: Option<String>,
}

/// Central link backed by a list of virtual peripherals.
#[derive(Debug)]
pub struct SimulatedCentralLink {
    events: mpsc::UnboundedSender<CentralEvent>,
    state: Mutex<CentralState>,
    next_handle: AtomicU64,
}

impl SimulatedCentralLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CentralEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Self {
            events,
            state: Mutex::new(CentralState::default()),
            next_handle: AtomicU64::new(1),
        };
        (Arc::new(link), rx)
    }

    /// Makes a peripheral visible to future scans.
    pub fn add_peripheral(&self, address: &str, name: Option<&str>, services: Vec<GattService>) {
        lock(&self.state).peers.push(SimulatedPeer {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
            services,
        });
    }

    /// Raises an arbitrary event as if the radio had reported it.
    pub fn emit(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }

    /// Pushes a value on a subscribed characteristic. Returns false if nobody subscribed.
    pub fn push_notification(&self, path: &CharacteristicPath, value: &[u8]) -> bool {
        let subscribed = lock(&self.state).subscriptions.contains_key(path);
        if subscribed {
            self.emit(CentralEvent::Notification {
                path: path.clone(),
                value: value.to_vec(),
            });
        }
        subscribed
    }

    /// Drops the connection to `address` without being asked to.
    pub fn drop_connection(&self, address: &str) {
        let was_connected = {
            let mut state = lock(&self.state);
            state.subscriptions.retain(|path, _| path.address != address);
            state.connected.remove(address)
        };
        if was_connected {
            self.emit(CentralEvent::ConnectionStateChanged {
                address: address.to_string(),
                status: GattStatus::Success,
                state: LinkState::Disconnected,
                handle: None,
            });
        }
    }

    pub fn refuse_connection(&self, address: &str) {
        lock(&self.state).refused_connections.insert(address.to_string());
    }

    pub fn fail_writes_to(&self, address: &str) {
        lock(&self.state).failing_writes.insert(address.to_string());
    }

    pub fn fail_descriptor_writes(&self) {
        lock(&self.state).failing_descriptor_writes = true;
    }

    pub fn fail_scan(&self, reason: &str) {
        lock(&self.state).scan_failure = Some(reason.to_string());
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    pub fn is_connected(&self, address: &str) -> bool {
        lock(&self.state).connected.contains(address)
    }

    pub fn subscription(&self, path: &CharacteristicPath) -> Option<CccdValue> {
        lock(&self.state).subscriptions.get(path).copied()
    }

    pub fn descriptor_writes(&self) -> Vec<(CharacteristicPath, CccdValue)> {
        lock(&self.state).descriptor_writes.clone()
    }

    pub fn writes(&self) -> Vec<(CharacteristicPath, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    fn require_connected(&self, address: &str) -> Result<(), BleError> {
        if lock(&self.state).connected.contains(address) {
            Ok(())
        } else {
            Err(BleError::Operation(format!("{} is not connected", address)))
        }
    }
}

#[async_trait]
impl CentralLink for SimulatedCentralLink {
    async fn start_scan(&self) -> Result<(), BleError> {
        let peers = {
            let mut state = lock(&self.state);
            if let Some(reason) = state.scan_failure.clone() {
                return Err(BleError::Operation(reason));
            }
            state.scanning = true;
            state.peers.clone()
        };
        for peer in peers {
            self.emit(CentralEvent::ScanResult {
                address: peer.address,
                name: peer.name,
                rssi: peer.rssi,
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        lock(&self.state).scanning = false;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<(), BleError> {
        let refused = {
            let mut state = lock(&self.state);
            if !state.peers.iter().any(|p| p.address == address) {
                return Err(BleError::UnknownDevice(address.to_string()));
            }
            let refused = state.refused_connections.contains(address);
            if !refused {
                state.connected.insert(address.to_string());
            }
            refused
        };

        let event = if refused {
            CentralEvent::ConnectionStateChanged {
                address: address.to_string(),
                status: GattStatus::Failure("connection refused".to_string()),
                state: LinkState::Disconnected,
                handle: None,
            }
        } else {
            CentralEvent::ConnectionStateChanged {
                address: address.to_string(),
                status: GattStatus::Success,
                state: LinkState::Connected,
                handle: Some(ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))),
            }
        };
        self.emit(event);
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), BleError> {
        self.require_connected(address)?;
        {
            let mut state = lock(&self.state);
            state.connected.remove(address);
            state.subscriptions.retain(|path, _| path.address != address);
        }
        self.emit(CentralEvent::ConnectionStateChanged {
            address: address.to_string(),
            status: GattStatus::Success,
            state: LinkState::Disconnected,
            handle: None,
        });
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<(), BleError> {
        self.require_connected(address)?;
        let services = lock(&self.state)
            .peers
            .iter()
            .find(|p| p.address == address)
            .map(|p| p.services.clone())
            .unwrap_or_default();
        self.emit(CentralEvent::ServicesDiscovered {
            address: address.to_string(),
            status: GattStatus::Success,
            services,
        });
        Ok(())
    }

    async fn write_descriptor(&self, path: &CharacteristicPath, value: CccdValue) -> Result<(), BleError> {
        self.require_connected(&path.address)?;
        let mut state = lock(&self.state);
        if state.failing_descriptor_writes {
            return Err(BleError::Operation("descriptor write rejected".to_string()));
        }
        state.descriptor_writes.push((path.clone(), value));
        if value.is_enable() {
            state.subscriptions.insert(path.clone(), value);
        } else {
            state.subscriptions.remove(path);
        }
        Ok(())
    }

    async fn write_without_response(&self, path: &CharacteristicPath, data: &[u8]) -> Result<(), BleError> {
        self.require_connected(&path.address)?;
        let mut state = lock(&self.state);
        if state.failing_writes.contains(&path.address) {
            return Err(BleError::Operation("simulated write failure".to_string()));
        }
        state.writes.push((path.clone(), data.to_vec()));
        Ok(())
    }

    async fn release(&self, address: &str) {
        debug!("Releasing simulated connection to {}", address);
        let mut state = lock(&self.state);
        state.connected.remove(address);
        state.subscriptions.retain(|path, _| path.address != address);
    }
}

#[derive(Debug, Default)]
struct PeripheralState {
    server_open: bool,
    services: Vec<GattService>,
    advertising: Option<AdvertiseSetting>,
    advertise_rejection: Option<String>,
    open_failure: Option<String>,
    peers: HashSet<String>,
    responses: Vec<(String, u64, WriteResponse)>,
    notifications: Vec<(String, Uuid, Vec<u8>)>,
    failing_peers: HashSet<String>,
    refuse_cancel: bool,
}

/// Peripheral link with virtual remote centrals.
#[derive(Debug)]
pub struct SimulatedPeripheralLink {
    events: mpsc::UnboundedSender<PeripheralEvent>,
    state: Mutex<PeripheralState>,
    next_request_id: AtomicU64,
}

impl SimulatedPeripheralLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeripheralEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Self {
            events,
            state: Mutex::new(PeripheralState::default()),
            next_request_id: AtomicU64::new(1),
        };
        (Arc::new(link), rx)
    }

    pub fn emit(&self, event: PeripheralEvent) {
        let _ = self.events.send(event);
    }

    /// A remote central connects.
    pub fn connect_peer(&self, address: &str, name: Option<&str>) {
        lock(&self.state).peers.insert(address.to_string());
        self.emit(PeripheralEvent::PeerConnected {
            address: address.to_string(),
            name: name.map(str::to_string),
        });
    }

    /// A remote central goes away.
    pub fn disconnect_peer(&self, address: &str) {
        lock(&self.state).peers.remove(address);
        self.emit(PeripheralEvent::PeerDisconnected {
            address: address.to_string(),
        });
    }

    /// A remote central writes `value` to `characteristic`. Returns the request id.
    pub fn write(&self, address: &str, characteristic: Uuid, value: &[u8], response_needed: bool) -> u64 {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.emit(PeripheralEvent::WriteRequest {
            address: address.to_string(),
            request_id,
            characteristic,
            value: value.to_vec(),
            response_needed,
        });
        request_id
    }

    pub fn reject_advertising(&self, reason: &str) {
        lock(&self.state).advertise_rejection = Some(reason.to_string());
    }

    pub fn fail_open(&self, reason: &str) {
        lock(&self.state).open_failure = Some(reason.to_string());
    }

    pub fn fail_notifications_to(&self, address: &str) {
        lock(&self.state).failing_peers.insert(address.to_string());
    }

    pub fn refuse_cancel_connection(&self) {
        lock(&self.state).refuse_cancel = true;
    }

    pub fn is_server_open(&self) -> bool {
        lock(&self.state).server_open
    }

    pub fn services(&self) -> Vec<GattService> {
        lock(&self.state).services.clone()
    }

    pub fn advertising(&self) -> Option<AdvertiseSetting> {
        lock(&self.state).advertising.clone()
    }

    pub fn has_peer(&self, address: &str) -> bool {
        lock(&self.state).peers.contains(address)
    }

    pub fn responses(&self) -> Vec<(String, u64, WriteResponse)> {
        lock(&self.state).responses.clone()
    }

    pub fn notifications(&self) -> Vec<(String, Uuid, Vec<u8>)> {
        lock(&self.state).notifications.clone()
    }
}

#[async_trait]
impl PeripheralLink for SimulatedPeripheralLink {
    async fn open_server(&self, services: &[GattService]) -> Result<(), BleError> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.open_failure.clone() {
            return Err(BleError::Operation(reason));
        }
        state.server_open = true;
        state.services = services.to_vec();
        Ok(())
    }

    async fn close_server(&self) -> Result<(), BleError> {
        let mut state = lock(&self.state);
        state.server_open = false;
        state.services.clear();
        state.peers.clear();
        Ok(())
    }

    async fn cancel_connection(&self, address: &str) -> Result<(), BleError> {
        let mut state = lock(&self.state);
        if state.refuse_cancel {
            return Err(BleError::Operation(format!("cannot cancel connection to {}", address)));
        }
        state.peers.remove(address);
        Ok(())
    }

    async fn start_advertising(&self, setting: &AdvertiseSetting, _service: Uuid) -> Result<(), BleError> {
        let rejection = {
            let mut state = lock(&self.state);
            let rejection = state.advertise_rejection.clone();
            if rejection.is_none() {
                state.advertising = Some(setting.clone());
            }
            rejection
        };
        match rejection {
            Some(reason) => self.emit(PeripheralEvent::AdvertiseFailed { reason }),
            None => self.emit(PeripheralEvent::AdvertiseStarted {
                setting: setting.clone(),
            }),
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        lock(&self.state).advertising = None;
        Ok(())
    }

    async fn send_response(&self, address: &str, request_id: u64, response: WriteResponse) -> Result<(), BleError> {
        lock(&self.state)
            .responses
            .push((address.to_string(), request_id, response));
        Ok(())
    }

    async fn notify(
        &self,
        peers: &[String],
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<(String, Result<(), BleError>)> {
        let mut state = lock(&self.state);
        peers
            .iter()
            .map(|peer| {
                let result = if state.failing_peers.contains(peer) {
                    Err(BleError::Operation(format!("notification to {} failed", peer)))
                } else {
                    state.notifications.push((peer.clone(), characteristic, value.to_vec()));
                    Ok(())
                };
                (peer.clone(), result)
            })
            .collect()
    }
}
