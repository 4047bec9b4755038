//! Central role engine
//! Scans for peripherals, connects to them, discovers their GATT layout and
//! manages notification subscriptions and the write fan-out set.
//!
//! Every public operation enqueues a command and returns immediately. A single
//! worker task consumes those commands together with the link's events, so all
//! state transitions happen in one place no matter how callbacks interleave.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{INBOUND_CHANNEL_CAPACITY, UNKNOWN_DEVICE_NAME};
use crate::core::bluetooth::error::{BleError, GattError};
use crate::core::bluetooth::link::{CentralEvent, CentralLink, LinkState};
use crate::core::bluetooth::notification::{needs_disable_write, subscription_value, CccdValue};
use crate::core::bluetooth::registry::{DeviceRegistry, RegistrySnapshot};
use crate::core::bluetooth::types::{
    Capabilities, CharacteristicPath, ConnectionHandle, ConnectionPhase, DisconnectReason,
    GattCharacteristic, GattService, GattStatus, PeerDevice, ScanState,
};
use crate::core::bridge::BleEndpoint;
use crate::core::service_state::ServiceState;

#[derive(Debug)]
enum CentralCommand {
    StartService,
    StopService,
    Scan,
    StopScan,
    Connect(String),
    Disconnect(String),
    SelectWrite(CharacteristicPath),
    DeselectWrite(CharacteristicPath),
    EnableNotification(CharacteristicPath),
    DisableNotification(CharacteristicPath),
    Send(Vec<u8>),
}

/// Handle to the central role worker.
pub struct CentralEngine {
    commands: mpsc::UnboundedSender<CentralCommand>,
    service_state: watch::Receiver<ServiceState>,
    scan_state: watch::Receiver<ScanState>,
    devices: watch::Receiver<Arc<RegistrySnapshot>>,
    last_failure: watch::Receiver<Option<GattError>>,
    incoming: broadcast::Sender<Vec<u8>>,
    cancel_token: CancellationToken,
}

impl CentralEngine {
    /// Spawns the worker on the current runtime.
    pub fn new(link: Arc<dyn CentralLink>, events: mpsc::UnboundedReceiver<CentralEvent>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (service_state_tx, service_state) = watch::channel(ServiceState::Stopped);
        let (scan_state_tx, scan_state) = watch::channel(ScanState::Stopped);
        let (last_failure_tx, last_failure) = watch::channel(None);
        let (incoming, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let registry = DeviceRegistry::new();
        let devices = registry.subscribe();
        let cancel_token = CancellationToken::new();

        let worker = CentralWorker {
            link,
            registry,
            service_state: service_state_tx,
            scan_state: scan_state_tx,
            last_failure: last_failure_tx,
            incoming: incoming.clone(),
            write_targets: HashSet::new(),
            pending_disconnects: HashSet::new(),
        };
        tokio::spawn(worker.run(command_rx, events, cancel_token.clone()));

        Self {
            commands,
            service_state,
            scan_state,
            devices,
            last_failure,
            incoming,
            cancel_token,
        }
    }

    fn send(&self, command: CentralCommand) {
        if let Err(e) = self.commands.send(command) {
            error!("Central worker is gone, dropping {:?}", e.0);
        }
    }

    pub fn start_service(&self) {
        self.send(CentralCommand::StartService);
    }

    /// Stops scanning, disconnects every device and forgets them.
    pub fn stop_service(&self) {
        self.send(CentralCommand::StopService);
    }

    pub fn scan_devices(&self) {
        self.send(CentralCommand::Scan);
    }

    pub fn stop_scan(&self) {
        self.send(CentralCommand::StopScan);
    }

    pub fn connect_to_device(&self, device: &PeerDevice) {
        self.send(CentralCommand::Connect(device.address.clone()));
    }

    /// Requests a disconnect. The device only turns Disconnected once the link confirms.
    pub fn disconnect_from_device(&self, device: &PeerDevice) {
        self.send(CentralCommand::Disconnect(device.address.clone()));
    }

    pub fn select_writeable_characteristic(&self, device: &PeerDevice, characteristic: &GattCharacteristic) {
        self.send(CentralCommand::SelectWrite(CharacteristicPath::of(device, characteristic)));
    }

    pub fn deselect_writeable_characteristic(&self, device: &PeerDevice, characteristic: &GattCharacteristic) {
        self.send(CentralCommand::DeselectWrite(CharacteristicPath::of(device, characteristic)));
    }

    pub fn enable_notification(&self, device: &PeerDevice, characteristic: &GattCharacteristic) {
        self.send(CentralCommand::EnableNotification(CharacteristicPath::of(device, characteristic)));
    }

    pub fn disable_notification(&self, device: &PeerDevice, characteristic: &GattCharacteristic) {
        self.send(CentralCommand::DisableNotification(CharacteristicPath::of(device, characteristic)));
    }

    /// Writes `data` without response to every selected characteristic of every connected device.
    pub fn send_to_connected_devices(&self, data: Vec<u8>) {
        self.send(CentralCommand::Send(data));
    }

    pub fn service_state(&self) -> watch::Receiver<ServiceState> {
        self.service_state.clone()
    }

    pub fn scan_state(&self) -> watch::Receiver<ScanState> {
        self.scan_state.clone()
    }

    /// Receiver of every registry snapshot.
    pub fn devices(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.devices.clone()
    }

    pub fn scanned_devices(&self) -> Vec<PeerDevice> {
        self.devices.borrow().scanned()
    }

    pub fn connected_devices(&self) -> Vec<PeerDevice> {
        self.devices.borrow().connected()
    }

    pub fn last_failure(&self) -> watch::Receiver<Option<GattError>> {
        self.last_failure.clone()
    }

    /// Payloads received through notifications and indications.
    pub fn incoming_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.incoming.subscribe()
    }
}

impl Drop for CentralEngine {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl BleEndpoint for CentralEngine {
    fn name(&self) -> &'static str {
        "central"
    }

    fn service_state(&self) -> watch::Receiver<ServiceState> {
        CentralEngine::service_state(self)
    }

    fn incoming_data(&self) -> broadcast::Receiver<Vec<u8>> {
        CentralEngine::incoming_data(self)
    }

    fn send_to_connected_devices(&self, data: Vec<u8>) {
        CentralEngine::send_to_connected_devices(self, data);
    }
}

struct CentralWorker {
    link: Arc<dyn CentralLink>,
    registry: DeviceRegistry,
    service_state: watch::Sender<ServiceState>,
    scan_state: watch::Sender<ScanState>,
    last_failure: watch::Sender<Option<GattError>>,
    incoming: broadcast::Sender<Vec<u8>>,
    write_targets: HashSet<CharacteristicPath>,
    pending_disconnects: HashSet<String>,
}

impl CentralWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CentralCommand>,
        mut events: mpsc::UnboundedReceiver<CentralEvent>,
        cancel_token: CancellationToken,
    ) {
        debug!("Central worker started");
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = events.recv() => self.handle_event(event).await,
                else => break,
            }
        }
        debug!("Central worker stopped");
    }

    async fn handle_command(&mut self, command: CentralCommand) {
        match command {
            CentralCommand::StartService => self.start_service(),
            CentralCommand::StopService => self.stop_service().await,
            CentralCommand::Scan => self.scan().await,
            CentralCommand::StopScan => self.stop_scan().await,
            CentralCommand::Connect(address) => self.connect(&address).await,
            CentralCommand::Disconnect(address) => self.disconnect(&address).await,
            CentralCommand::SelectWrite(path) => self.select_write(path),
            CentralCommand::DeselectWrite(path) => self.deselect_write(&path),
            CentralCommand::EnableNotification(path) => self.enable_notification(&path).await,
            CentralCommand::DisableNotification(path) => self.disable_notification(&path).await,
            CentralCommand::Send(data) => self.send_to_connected_devices(&data).await,
        }
    }

    async fn handle_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::ScanResult { address, name, rssi } => self.on_scan_result(address, name, rssi),
            CentralEvent::ScanFailed { reason } => {
                error!("Scan failed: {}", reason);
                self.scan_state.send_replace(ScanState::Stopped);
                self.fail(GattError::Transport(BleError::Operation(reason)));
            }
            CentralEvent::ConnectionStateChanged {
                address,
                status,
                state,
                handle,
            } => self.on_connection_state_changed(&address, status, state, handle).await,
            CentralEvent::ServicesDiscovered {
                address,
                status,
                services,
            } => self.on_services_discovered(&address, status, services),
            CentralEvent::Notification { path, value } => {
                debug!("Notification from {}: {:?}", path, value);
                // No subscribers is fine; payloads are not retained.
                let _ = self.incoming.send(value);
            }
        }
    }

    fn start_service(&mut self) {
        if self.service_state.borrow().is_running() {
            debug!("Central service already running");
            return;
        }
        info!("Central service started");
        self.service_state.send_replace(ServiceState::Running);
    }

    async fn stop_service(&mut self) {
        if !self.service_state.borrow().is_running() {
            debug!("Central service already stopped");
            return;
        }
        info!("Stopping central service");
        self.stop_scan().await;

        let snapshot = self.registry.snapshot();
        for device in snapshot.devices().iter().filter(|d| d.phase.is_busy() || d.handle.is_some()) {
            if let Err(e) = self.link.disconnect(&device.address).await {
                warn!("Failed to disconnect {} while stopping: {}", device.address, e);
            }
            self.link.release(&device.address).await;
        }

        self.registry.clear();
        self.write_targets.clear();
        self.pending_disconnects.clear();
        self.service_state.send_replace(ServiceState::Stopped);
        info!("Central service stopped");
    }

    async fn scan(&mut self) {
        if *self.scan_state.borrow() == ScanState::Started {
            debug!("Scan already running");
            return;
        }
        match self.link.start_scan().await {
            Ok(()) => {
                info!("Device scan started");
                self.scan_state.send_replace(ScanState::Started);
            }
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.scan_state.send_replace(ScanState::Stopped);
                self.fail(e.into());
            }
        }
    }

    async fn stop_scan(&mut self) {
        if let Err(e) = self.link.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        if self.scan_state.send_replace(ScanState::Stopped) == ScanState::Started {
            info!("Device scan stopped");
        }
    }

    fn on_scan_result(&mut self, address: String, name: Option<String>, rssi: Option<i16>) {
        let mut device = PeerDevice::new(address.clone(), name.clone().unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()));
        device.rssi = rssi;
        if self.registry.insert_if_absent(device) {
            info!("Found device - Address: {}, Name: {:?}, RSSI: {:?}", address, name, rssi);
            return;
        }
        self.registry.update(&address, |d| {
            d.rssi = rssi;
            if let Some(name) = name {
                d.name = name;
            }
        });
    }

    async fn connect(&mut self, address: &str) {
        let Some(device) = self.registry.get(address) else {
            warn!("Cannot connect to {}: device not found", address);
            return;
        };
        if device.phase.is_busy() {
            warn!("Device {} is already {:?}, ignoring connect", address, device.phase);
            return;
        }

        info!("Initiating connection to {}...", address);
        self.registry.update(address, |d| {
            d.phase = ConnectionPhase::Connecting;
            d.last_disconnect = None;
        });

        if let Err(e) = self.link.connect(address).await {
            error!("Failed to connect to {}: {}", address, e);
            self.mark_disconnected(address, DisconnectReason::Failed(GattStatus::Failure(e.to_string())))
                .await;
            self.fail(e.into());
        }
    }

    async fn disconnect(&mut self, address: &str) {
        let Some(device) = self.registry.get(address) else {
            warn!("Cannot disconnect from {}: device not found", address);
            return;
        };
        if !device.phase.is_busy() {
            debug!("Device {} is not connected", address);
            return;
        }

        info!("Disconnecting from device {}", address);
        self.pending_disconnects.insert(address.to_string());
        if let Err(e) = self.link.disconnect(address).await {
            error!("Failed to disconnect from {}: {}", address, e);
            self.pending_disconnects.remove(address);
            self.fail(e.into());
        }
    }

    async fn on_connection_state_changed(
        &mut self,
        address: &str,
        status: GattStatus,
        state: LinkState,
        handle: Option<ConnectionHandle>,
    ) {
        let Some(device) = self.registry.get(address) else {
            debug!("Connection event for unknown device {} ignored", address);
            return;
        };

        if !status.is_success() {
            if !device.phase.is_busy() {
                debug!("{} already {:?}, ignoring failure {}", address, device.phase, status);
                return;
            }
            error!("Connection to {} failed with {}", address, status);
            self.pending_disconnects.remove(address);
            self.fail(GattError::Transport(BleError::Operation(format!(
                "connection to {} failed: {}",
                address, status
            ))));
            self.mark_disconnected(address, DisconnectReason::Failed(status)).await;
            return;
        }

        match state {
            LinkState::Connected => {
                if device.phase != ConnectionPhase::Connecting {
                    warn!("Ignoring connected report for {} while {:?}", address, device.phase);
                    if !device.phase.is_busy() {
                        self.link.release(address).await;
                    }
                    return;
                }
                self.registry.update(address, |d| {
                    d.phase = ConnectionPhase::Connected;
                    d.handle = handle;
                });
                info!("Connected to {}, discovering services...", address);
                if let Err(e) = self.link.discover_services(address).await {
                    error!("Failed to start service discovery on {}: {}", address, e);
                    self.fail(e.into());
                }
            }
            LinkState::Disconnected => {
                if !device.phase.is_busy() {
                    debug!("{} already {:?}, ignoring disconnect report", address, device.phase);
                    return;
                }
                let reason = if self.pending_disconnects.remove(address) {
                    DisconnectReason::Requested
                } else {
                    DisconnectReason::Unexpected
                };
                self.mark_disconnected(address, reason).await;
            }
        }
    }

    fn on_services_discovered(&mut self, address: &str, status: GattStatus, services: Vec<GattService>) {
        let Some(device) = self.registry.get(address) else {
            debug!("Discovery result for unknown device {} ignored", address);
            return;
        };
        if !device.is_connected() {
            warn!("Discovery result for {} arrived while {:?}, ignored", address, device.phase);
            return;
        }
        if !status.is_success() {
            error!("Service discovery on {} failed with {}", address, status);
            self.fail(GattError::Transport(BleError::Operation(format!(
                "service discovery on {} failed: {}",
                address, status
            ))));
            return;
        }

        for service in &services {
            debug!("Available service on {}: {} ({} characteristics)", address, service.uuid, service.characteristics.len());
        }
        info!("Discovered {} services on {}", services.len(), address);
        self.registry.update(address, |d| {
            d.phase = ConnectionPhase::ServicesDiscovered;
            d.services = services;
        });
    }

    /// Moves `address` to Disconnected, keeping its topology for display but
    /// dropping the handle, the selections and its write targets.
    async fn mark_disconnected(&mut self, address: &str, reason: DisconnectReason) {
        match &reason {
            DisconnectReason::Requested => info!("Disconnected from {}", address),
            DisconnectReason::Unexpected => warn!("Lost connection to {}", address),
            DisconnectReason::Failed(status) => warn!("Connection to {} ended with {}", address, status),
        }
        self.write_targets.retain(|path| path.address != address);
        self.registry.update(address, |d| {
            d.phase = ConnectionPhase::Disconnected;
            d.handle = None;
            d.last_disconnect = Some(reason);
            d.services
                .iter_mut()
                .flat_map(|s| s.characteristics.iter_mut())
                .for_each(|c| c.selected = false);
        });
        self.link.release(address).await;
    }

    /// Finds the characteristic at `path` on a connected device.
    fn locate(&self, path: &CharacteristicPath) -> Result<GattCharacteristic, GattError> {
        let device = self
            .registry
            .get(&path.address)
            .ok_or_else(|| GattError::DeviceNotFound(path.address.clone()))?;
        if !device.is_connected() {
            return Err(GattError::NotConnected(path.address.clone()));
        }
        let service = device.service(path.service).ok_or_else(|| GattError::ServiceNotFound {
            address: path.address.clone(),
            service: path.service,
        })?;
        service
            .characteristic(path.characteristic)
            .cloned()
            .ok_or(GattError::CharacteristicNotFound {
                service: path.service,
                characteristic: path.characteristic,
            })
    }

    fn set_selected(&self, path: &CharacteristicPath, selected: bool) {
        self.registry.update(&path.address, |d| {
            if let Some(c) = d.characteristic_mut(path.service, path.characteristic) {
                c.selected = selected;
            }
        });
    }

    fn select_write(&mut self, path: CharacteristicPath) {
        if let Err(e) = self.locate(&path) {
            error!("Cannot select {} for writing: {}", path, e);
            self.fail(e);
            return;
        }
        self.set_selected(&path, true);
        info!("Selected {} for writing", path);
        self.write_targets.insert(path);
    }

    fn deselect_write(&mut self, path: &CharacteristicPath) {
        if let Err(e) = self.locate(path) {
            error!("Cannot deselect {}: {}", path, e);
            self.fail(e);
            return;
        }
        self.write_targets.remove(path);
        self.set_selected(path, false);
        info!("Deselected {} for writing", path);
    }

    async fn enable_notification(&mut self, path: &CharacteristicPath) {
        let characteristic = match self.locate(path) {
            Ok(c) => c,
            Err(e) => {
                error!("Cannot enable notifications on {}: {}", path, e);
                self.fail(e);
                return;
            }
        };
        let value = match subscription_value(&characteristic) {
            Ok(v) => v,
            Err(e) => {
                error!("Cannot enable notifications on {}: {}", path, e);
                self.fail(e);
                return;
            }
        };

        debug!("Writing {:02X?} to the CCCD of {}", value.bytes(), path);
        match self.link.write_descriptor(path, value).await {
            Ok(()) => {
                info!("Enabled {:?} on {}", value, path);
                self.set_selected(path, true);
            }
            Err(e) => {
                error!("Failed to write CCCD of {}: {}", path, e);
                self.fail(e.into());
            }
        }
    }

    async fn disable_notification(&mut self, path: &CharacteristicPath) {
        match self.locate(path) {
            Ok(characteristic) if needs_disable_write(&characteristic) => {
                if let Err(e) = self.link.write_descriptor(path, CccdValue::Disable).await {
                    error!("Failed to write CCCD of {}: {}", path, e);
                    self.fail(e.into());
                }
            }
            Ok(_) => debug!("{} has nothing to unsubscribe", path),
            Err(e) => warn!("Disabling notifications on {}: {}", path, e),
        }
        self.set_selected(path, false);
        info!("Disabled notifications on {}", path);
    }

    async fn send_to_connected_devices(&mut self, data: &[u8]) {
        let snapshot = self.registry.snapshot();
        for device in snapshot.devices().iter().filter(|d| d.is_connected()) {
            for path in self.write_targets.iter().filter(|p| p.address == device.address) {
                let Some(characteristic) = device.characteristic(path.service, path.characteristic) else {
                    error!("Write target {} is not in the topology of {}", path, device.address);
                    continue;
                };
                if !characteristic.capabilities.contains(Capabilities::WRITE_NO_RESPONSE) {
                    error!(
                        "Skipping {}: {}",
                        path,
                        GattError::NotWritableWithoutResponse(characteristic.uuid)
                    );
                    continue;
                }
                if let Err(e) = self.link.write_without_response(path, data).await {
                    error!("Failed to write {} bytes to {}: {}", data.len(), path, e);
                }
            }
        }
    }

    fn fail(&self, error: GattError) {
        self.last_failure.send_replace(Some(error));
    }
}
