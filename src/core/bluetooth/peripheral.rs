//! Peripheral role engine
//! Hosts the relay GATT service, advertises it, accepts connections and writes
//! from remote centrals and notifies outbound payloads to every connected peer.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ble_config::BleConfig;
use crate::core::bluetooth::constants::{
    INBOUND_CHANNEL_CAPACITY, UNKNOWN_DEVICE_NAME, UUID_CCCD, UUID_RELAY_NOTIFY_CHAR, UUID_RELAY_SERVICE,
    UUID_RELAY_WRITE_CHAR,
};
use crate::core::bluetooth::error::GattError;
use crate::core::bluetooth::link::{PeripheralEvent, PeripheralLink, WriteResponse};
use crate::core::bluetooth::registry::{DeviceRegistry, RegistrySnapshot};
use crate::core::bluetooth::types::{
    AdvertiseState, Capabilities, ConnectionHandle, ConnectionPhase, GattCharacteristic, GattServerState,
    GattService, PeerDevice,
};
use crate::core::bridge::BleEndpoint;
use crate::core::service_state::ServiceState;

/// The fixed GATT service hosted by the peripheral role.
pub fn relay_service() -> GattService {
    GattService {
        uuid: UUID_RELAY_SERVICE,
        is_primary: true,
        characteristics: vec![
            GattCharacteristic::new(UUID_RELAY_SERVICE, UUID_RELAY_NOTIFY_CHAR, Capabilities::NOTIFY)
                .with_descriptor(UUID_CCCD),
            GattCharacteristic::new(
                UUID_RELAY_SERVICE,
                UUID_RELAY_WRITE_CHAR,
                Capabilities::WRITE | Capabilities::WRITE_NO_RESPONSE,
            ),
        ],
    }
}

#[derive(Debug)]
enum PeripheralCommand {
    StartService,
    StopService,
    OpenServer,
    CloseServer,
    Advertise,
    StopAdvertising,
    Disconnect(String),
    Send(Vec<u8>),
}

/// Handle to the peripheral role worker.
pub struct PeripheralEngine {
    commands: mpsc::UnboundedSender<PeripheralCommand>,
    service_state: watch::Receiver<ServiceState>,
    server_state: watch::Receiver<GattServerState>,
    advertise_state: watch::Receiver<AdvertiseState>,
    devices: watch::Receiver<Arc<RegistrySnapshot>>,
    last_failure: watch::Receiver<Option<GattError>>,
    incoming: broadcast::Sender<Vec<u8>>,
    cancel_token: CancellationToken,
}

impl PeripheralEngine {
    /// Spawns the worker on the current runtime. `ble_config` is read each
    /// time advertising starts.
    pub fn new(
        link: Arc<dyn PeripheralLink>,
        events: mpsc::UnboundedReceiver<PeripheralEvent>,
        ble_config: watch::Receiver<BleConfig>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (service_state_tx, service_state) = watch::channel(ServiceState::Stopped);
        let (server_state_tx, server_state) = watch::channel(GattServerState::Closed);
        let (advertise_state_tx, advertise_state) = watch::channel(AdvertiseState::Stopped);
        let (last_failure_tx, last_failure) = watch::channel(None);
        let (incoming, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let registry = DeviceRegistry::new();
        let devices = registry.subscribe();
        let cancel_token = CancellationToken::new();

        let worker = PeripheralWorker {
            link,
            ble_config,
            registry,
            service_state: service_state_tx,
            server_state: server_state_tx,
            advertise_state: advertise_state_tx,
            last_failure: last_failure_tx,
            incoming: incoming.clone(),
            advertise_pending: false,
            next_handle: 1,
        };
        tokio::spawn(worker.run(command_rx, events, cancel_token.clone()));

        Self {
            commands,
            service_state,
            server_state,
            advertise_state,
            devices,
            last_failure,
            incoming,
            cancel_token,
        }
    }

    fn send(&self, command: PeripheralCommand) {
        if let Err(e) = self.commands.send(command) {
            error!("Peripheral worker is gone, dropping {:?}", e.0);
        }
    }

    pub fn start_service(&self) {
        self.send(PeripheralCommand::StartService);
    }

    /// Stops advertising and closes the GATT server.
    pub fn stop_service(&self) {
        self.send(PeripheralCommand::StopService);
    }

    pub fn open_gatt_server(&self) {
        self.send(PeripheralCommand::OpenServer);
    }

    /// Disconnects every peer, then removes the service.
    pub fn close_gatt_server(&self) {
        self.send(PeripheralCommand::CloseServer);
    }

    /// Starts advertising with the current `AdvertiseSetting`. The outcome shows up on `advertise_state`.
    pub fn advertise_service(&self) {
        self.send(PeripheralCommand::Advertise);
    }

    pub fn stop_advertising(&self) {
        self.send(PeripheralCommand::StopAdvertising);
    }

    pub fn disconnect_from_device(&self, device: &PeerDevice) {
        self.send(PeripheralCommand::Disconnect(device.address.clone()));
    }

    /// Notifies `data` to every connected peer.
    pub fn send_to_connected_devices(&self, data: Vec<u8>) {
        self.send(PeripheralCommand::Send(data));
    }

    pub fn service_state(&self) -> watch::Receiver<ServiceState> {
        self.service_state.clone()
    }

    pub fn gatt_server_state(&self) -> watch::Receiver<GattServerState> {
        self.server_state.clone()
    }

    pub fn advertise_state(&self) -> watch::Receiver<AdvertiseState> {
        self.advertise_state.clone()
    }

    pub fn devices(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.devices.clone()
    }

    pub fn connected_devices(&self) -> Vec<PeerDevice> {
        self.devices.borrow().connected()
    }

    pub fn last_failure(&self) -> watch::Receiver<Option<GattError>> {
        self.last_failure.clone()
    }

    /// Payloads written by remote centrals.
    pub fn incoming_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.incoming.subscribe()
    }
}

impl Drop for PeripheralEngine {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl BleEndpoint for PeripheralEngine {
    fn name(&self) -> &'static str {
        "peripheral"
    }

    fn service_state(&self) -> watch::Receiver<ServiceState> {
        PeripheralEngine::service_state(self)
    }

    fn incoming_data(&self) -> broadcast::Receiver<Vec<u8>> {
        PeripheralEngine::incoming_data(self)
    }

    fn send_to_connected_devices(&self, data: Vec<u8>) {
        PeripheralEngine::send_to_connected_devices(self, data);
    }
}

struct PeripheralWorker {
    link: Arc<dyn PeripheralLink>,
    ble_config: watch::Receiver<BleConfig>,
    registry: DeviceRegistry,
    service_state: watch::Sender<ServiceState>,
    server_state: watch::Sender<GattServerState>,
    advertise_state: watch::Sender<AdvertiseState>,
    last_failure: watch::Sender<Option<GattError>>,
    incoming: broadcast::Sender<Vec<u8>>,
    /// A start request is waiting for the link's verdict.
    advertise_pending: bool,
    next_handle: u64,
}

impl PeripheralWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PeripheralCommand>,
        mut events: mpsc::UnboundedReceiver<PeripheralEvent>,
        cancel_token: CancellationToken,
    ) {
        debug!("Peripheral worker started");
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = events.recv() => self.handle_event(event).await,
                else => break,
            }
        }
        debug!("Peripheral worker stopped");
    }

    async fn handle_command(&mut self, command: PeripheralCommand) {
        match command {
            PeripheralCommand::StartService => {
                if self.service_state.send_replace(ServiceState::Running) != ServiceState::Running {
                    info!("Peripheral service started");
                }
            }
            PeripheralCommand::StopService => self.stop_service().await,
            PeripheralCommand::OpenServer => self.open_server().await,
            PeripheralCommand::CloseServer => self.close_server().await,
            PeripheralCommand::Advertise => self.advertise().await,
            PeripheralCommand::StopAdvertising => self.stop_advertising().await,
            PeripheralCommand::Disconnect(address) => self.disconnect(&address).await,
            PeripheralCommand::Send(data) => self.send_to_connected_devices(&data).await,
        }
    }

    async fn handle_event(&mut self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::PeerConnected { address, name } => {
                info!("Device {} connected", address);
                let mut device = PeerDevice::new(address, name.unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()));
                device.phase = ConnectionPhase::Connected;
                device.handle = Some(self.allocate_handle());
                self.registry.upsert(device);
            }
            PeripheralEvent::PeerDisconnected { address } => {
                if self.registry.remove(&address).is_some() {
                    info!("Device {} disconnected", address);
                }
            }
            PeripheralEvent::WriteRequest {
                address,
                request_id,
                characteristic,
                value,
                response_needed,
            } => self.on_write(&address, request_id, characteristic, value, response_needed).await,
            PeripheralEvent::DescriptorWriteRequest {
                address,
                request_id,
                descriptor,
                value,
                response_needed,
            } => {
                debug!("Descriptor {} written by {}: {:?}", descriptor, address, value);
                if response_needed {
                    self.respond(&address, request_id, WriteResponse::Success).await;
                }
            }
            PeripheralEvent::AdvertiseStarted { setting } => {
                if !self.advertise_pending {
                    debug!("Ignoring advertising start nobody is waiting for");
                    return;
                }
                self.advertise_pending = false;
                info!("Advertising started: {:?}", setting);
                self.advertise_state.send_replace(AdvertiseState::Started(setting));
            }
            PeripheralEvent::AdvertiseFailed { reason } => {
                if !self.advertise_pending {
                    debug!("Ignoring advertising failure nobody is waiting for: {}", reason);
                    return;
                }
                self.advertise_pending = false;
                error!("Advertising failed: {}", reason);
                self.advertise_state.send_replace(AdvertiseState::Error(reason));
            }
        }
    }

    fn allocate_handle(&mut self) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    async fn stop_service(&mut self) {
        if !self.service_state.borrow().is_running() {
            debug!("Peripheral service already stopped");
            return;
        }
        info!("Stopping peripheral service");
        self.stop_advertising().await;
        self.close_server().await;
        self.service_state.send_replace(ServiceState::Stopped);
        info!("Peripheral service stopped");
    }

    async fn open_server(&mut self) {
        if *self.server_state.borrow() == GattServerState::Open {
            debug!("GATT server already open");
            return;
        }
        match self.link.open_server(&[relay_service()]).await {
            Ok(()) => {
                info!("GATT server opened with service {}", UUID_RELAY_SERVICE);
                self.server_state.send_replace(GattServerState::Open);
            }
            Err(e) => {
                error!("Failed to open GATT server: {}", e);
                self.server_state.send_replace(GattServerState::Error(e.to_string()));
                self.last_failure.send_replace(Some(e.into()));
            }
        }
    }

    async fn close_server(&mut self) {
        if self.advertise_pending || matches!(*self.advertise_state.borrow(), AdvertiseState::Started(_)) {
            self.stop_advertising().await;
        }
        for device in self.registry.snapshot().devices() {
            if let Err(e) = self.link.cancel_connection(&device.address).await {
                warn!("Failed to disconnect {} while closing server: {}", device.address, e);
            }
        }
        self.registry.clear();

        match self.link.close_server().await {
            Ok(()) => {
                if self.server_state.send_replace(GattServerState::Closed) != GattServerState::Closed {
                    info!("GATT server closed");
                }
            }
            Err(e) => {
                error!("Failed to close GATT server: {}", e);
                self.server_state.send_replace(GattServerState::Error(e.to_string()));
                self.last_failure.send_replace(Some(e.into()));
            }
        }
    }

    async fn advertise(&mut self) {
        if matches!(*self.advertise_state.borrow(), AdvertiseState::Started(_)) || self.advertise_pending {
            debug!("Advertising already started");
            return;
        }
        if *self.server_state.borrow() != GattServerState::Open {
            error!("Cannot advertise: {}", GattError::ServerNotOpen);
            self.advertise_state
                .send_replace(AdvertiseState::Error(GattError::ServerNotOpen.to_string()));
            self.last_failure.send_replace(Some(GattError::ServerNotOpen));
            return;
        }

        let setting = self.ble_config.borrow().advertise_setting.clone();
        self.advertise_pending = true;
        if let Err(e) = self.link.start_advertising(&setting, UUID_RELAY_SERVICE).await {
            self.advertise_pending = false;
            error!("Failed to start advertising: {}", e);
            self.advertise_state.send_replace(AdvertiseState::Error(e.to_string()));
            self.last_failure.send_replace(Some(e.into()));
        }
    }

    async fn stop_advertising(&mut self) {
        if let Err(e) = self.link.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
        }
        self.advertise_pending = false;
        if self.advertise_state.send_replace(AdvertiseState::Stopped) != AdvertiseState::Stopped {
            info!("Advertising stopped");
        }
    }

    /// Drops the peer right away; the link does not reliably report a forced
    /// disconnect. If the link refuses, the peer is put back.
    async fn disconnect(&mut self, address: &str) {
        let Some(device) = self.registry.remove(address) else {
            warn!("Cannot disconnect {}: not connected", address);
            return;
        };
        info!("Disconnecting device {}", address);
        if let Err(e) = self.link.cancel_connection(address).await {
            warn!("Failed to disconnect {}, keeping it connected: {}", address, e);
            self.registry.insert_if_absent(device);
            self.last_failure.send_replace(Some(e.into()));
        }
    }

    async fn on_write(
        &mut self,
        address: &str,
        request_id: u64,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    ) {
        if characteristic != UUID_RELAY_WRITE_CHAR {
            warn!("Rejected write from {} to characteristic {}", address, characteristic);
            if response_needed {
                self.respond(address, request_id, WriteResponse::WriteNotPermitted).await;
            }
            return;
        }

        debug!("Received {} bytes from {}", value.len(), address);
        if response_needed {
            self.respond(address, request_id, WriteResponse::Success).await;
        }
        let _ = self.incoming.send(value);
    }

    async fn respond(&self, address: &str, request_id: u64, response: WriteResponse) {
        if let Err(e) = self.link.send_response(address, request_id, response).await {
            error!("Failed to respond to request {} from {}: {}", request_id, address, e);
        }
    }

    async fn send_to_connected_devices(&mut self, data: &[u8]) {
        let peers: Vec<String> = self
            .registry
            .snapshot()
            .connected()
            .into_iter()
            .map(|d| d.address)
            .collect();
        if peers.is_empty() {
            return;
        }

        for (peer, result) in self.link.notify(&peers, UUID_RELAY_NOTIFY_CHAR, data).await {
            if let Err(e) = result {
                error!("Failed to notify {} bytes to {}: {}", data.len(), peer, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ble_config::AdvertiseSetting;
    use crate::core::bluetooth::simulated::SimulatedPeripheralLink;
    use std::time::Duration;
    use tokio::time::timeout;

    const PEER: &str = "11:22:33:44:55:66";
    const WAIT: Duration = Duration::from_secs(2);

    fn engine() -> (PeripheralEngine, Arc<SimulatedPeripheralLink>, watch::Sender<BleConfig>) {
        let (link, events) = SimulatedPeripheralLink::new();
        let (config_tx, config_rx) = watch::channel(BleConfig::default());
        let engine = PeripheralEngine::new(link.clone(), events, config_rx);
        (engine, link, config_tx)
    }

    async fn open(engine: &PeripheralEngine) {
        engine.start_service();
        engine.open_gatt_server();
        timeout(WAIT, engine.gatt_server_state().wait_for(|s| *s == GattServerState::Open))
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_for_peers(engine: &PeripheralEngine, count: usize) {
        timeout(WAIT, engine.devices().wait_for(|s| s.len() == count))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_relay_service_layout() {
        let service = relay_service();
        let notify = service.characteristic(UUID_RELAY_NOTIFY_CHAR).unwrap();
        let write = service.characteristic(UUID_RELAY_WRITE_CHAR).unwrap();
        assert!(notify.capabilities.contains(Capabilities::NOTIFY));
        assert!(notify.cccd().is_some());
        assert!(write.capabilities.contains(Capabilities::WRITE_NO_RESPONSE));
    }

    #[tokio::test]
    async fn test_advertising_requires_open_server() {
        let (engine, link, _config) = engine();
        engine.advertise_service();

        timeout(WAIT, engine.advertise_state().wait_for(|s| matches!(s, AdvertiseState::Error(_))))
            .await
            .unwrap()
            .unwrap();
        assert!(link.advertising().is_none());
    }

    #[tokio::test]
    async fn test_advertising_uses_current_setting() {
        let (engine, link, config) = engine();
        open(&engine).await;
        config.send_modify(|c| c.advertise_setting.include_device_name = true);

        engine.advertise_service();
        let state = timeout(WAIT, engine.advertise_state().wait_for(|s| matches!(s, AdvertiseState::Started(_))))
            .await
            .unwrap()
            .unwrap()
            .clone();

        let expected = AdvertiseSetting {
            include_device_name: true,
            ..AdvertiseSetting::default()
        };
        assert_eq!(state, AdvertiseState::Started(expected.clone()));
        assert_eq!(link.advertising(), Some(expected));
    }

    #[tokio::test]
    async fn test_open_registers_relay_service() {
        let (engine, link, _config) = engine();
        open(&engine).await;
        assert_eq!(link.services(), vec![relay_service()]);
    }

    #[tokio::test]
    async fn test_stop_right_after_advertise_ends_stopped() {
        let (engine, link, _config) = engine();
        open(&engine).await;

        for _ in 0..20 {
            engine.advertise_service();
            engine.stop_advertising();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(*engine.advertise_state().borrow(), AdvertiseState::Stopped);
            assert!(link.advertising().is_none());
        }
    }

    #[tokio::test]
    async fn test_late_advertise_verdicts_are_ignored() {
        let (engine, link, _config) = engine();
        open(&engine).await;
        engine.advertise_service();
        timeout(WAIT, engine.advertise_state().wait_for(|s| matches!(s, AdvertiseState::Started(_))))
            .await
            .unwrap()
            .unwrap();
        engine.stop_advertising();
        timeout(WAIT, engine.advertise_state().wait_for(|s| *s == AdvertiseState::Stopped))
            .await
            .unwrap()
            .unwrap();

        link.emit(PeripheralEvent::AdvertiseStarted {
            setting: AdvertiseSetting::default(),
        });
        link.emit(PeripheralEvent::AdvertiseFailed {
            reason: "late".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*engine.advertise_state().borrow(), AdvertiseState::Stopped);

        // A fresh start still reaches the link.
        engine.advertise_service();
        timeout(WAIT, engine.advertise_state().wait_for(|s| matches!(s, AdvertiseState::Started(_))))
            .await
            .unwrap()
            .unwrap();
        assert!(link.advertising().is_some());
    }

    #[tokio::test]
    async fn test_close_server_stops_advertising() {
        let (engine, link, _config) = engine();
        open(&engine).await;
        engine.advertise_service();
        engine.close_gatt_server();
        timeout(WAIT, engine.gatt_server_state().wait_for(|s| *s == GattServerState::Closed))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*engine.advertise_state().borrow(), AdvertiseState::Stopped);
        assert!(link.advertising().is_none());
    }

    #[tokio::test]
    async fn test_platform_rejection_is_an_error_state() {
        let (engine, link, _config) = engine();
        link.reject_advertising("too many advertisers");
        open(&engine).await;

        engine.advertise_service();
        let state = timeout(WAIT, engine.advertise_state().wait_for(|s| matches!(s, AdvertiseState::Error(_))))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(state, AdvertiseState::Error("too many advertisers".to_string()));
    }

    #[tokio::test]
    async fn test_open_failure_is_an_error_state() {
        let (engine, link, _config) = engine();
        link.fail_open("adapter busy");
        engine.open_gatt_server();

        timeout(WAIT, engine.gatt_server_state().wait_for(|s| matches!(s, GattServerState::Error(_))))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connections_are_tracked_and_forgotten() {
        let (engine, link, _config) = engine();
        open(&engine).await;

        link.connect_peer(PEER, Some("phone"));
        wait_for_peers(&engine, 1).await;
        let device = engine.connected_devices().pop().unwrap();
        assert_eq!(device.phase, ConnectionPhase::Connected);
        assert!(device.handle.is_some());

        link.disconnect_peer(PEER);
        wait_for_peers(&engine, 0).await;
    }

    #[tokio::test]
    async fn test_forced_disconnect_removes_peer_eagerly() {
        let (engine, link, _config) = engine();
        open(&engine).await;
        link.connect_peer(PEER, None);
        wait_for_peers(&engine, 1).await;

        engine.disconnect_from_device(&PeerDevice::new(PEER, "phone"));
        wait_for_peers(&engine, 0).await;
        assert!(!link.has_peer(PEER));
    }

    #[tokio::test]
    async fn test_refused_forced_disconnect_keeps_peer() {
        let (engine, link, _config) = engine();
        open(&engine).await;
        link.refuse_cancel_connection();
        link.connect_peer(PEER, None);
        wait_for_peers(&engine, 1).await;

        engine.disconnect_from_device(&PeerDevice::new(PEER, "phone"));
        timeout(WAIT, engine.last_failure().wait_for(|f| f.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.connected_devices().len(), 1);
    }

    #[tokio::test]
    async fn test_write_to_other_characteristic_is_rejected() {
        let (engine, link, _config) = engine();
        open(&engine).await;
        let mut incoming = engine.incoming_data();
        link.connect_peer(PEER, None);

        let request = link.write(PEER, UUID_RELAY_NOTIFY_CHAR, &[0x01], true);
        let accepted = link.write(PEER, UUID_RELAY_WRITE_CHAR, &[0x02], false);
        let payload = timeout(WAIT, incoming.recv()).await.unwrap().unwrap();

        assert_eq!(payload, vec![0x02]);
        assert_ne!(request, accepted);
        assert_eq!(
            link.responses(),
            vec![(PEER.to_string(), request, WriteResponse::WriteNotPermitted)]
        );
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_stop_other_peers() {
        let (engine, link, _config) = engine();
        open(&engine).await;
        link.connect_peer("A", None);
        link.connect_peer("B", None);
        link.connect_peer("C", None);
        wait_for_peers(&engine, 3).await;
        link.fail_notifications_to("B");

        engine.send_to_connected_devices(vec![0x42]);
        timeout(WAIT, async {
            while link.notifications().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let peers: Vec<String> = link.notifications().into_iter().map(|(peer, _, _)| peer).collect();
        assert_eq!(peers, vec!["A".to_string(), "C".to_string()]);
    }

    #[tokio::test]
    async fn test_close_server_disconnects_everyone_first() {
        let (engine, link, _config) = engine();
        open(&engine).await;
        link.connect_peer("A", None);
        link.connect_peer("B", None);
        wait_for_peers(&engine, 2).await;

        engine.close_gatt_server();
        timeout(WAIT, engine.gatt_server_state().wait_for(|s| *s == GattServerState::Closed))
            .await
            .unwrap()
            .unwrap();

        assert!(engine.connected_devices().is_empty());
        assert!(!link.is_server_open());
        assert!(!link.has_peer("A"));
    }
}
