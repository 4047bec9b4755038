//! Central link over bluest
//! Connect and discovery run on spawned tasks and report back through the
//! event channel. Each connection gets a watcher that polls the link and
//! reports the drop; each enabled characteristic gets a notification task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, CharacteristicProperties, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{CONNECTION_POLL_INTERVAL_MS, UUID_CCCD};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::link::{CentralEvent, CentralLink, LinkState};
use crate::core::bluetooth::notification::CccdValue;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{
    Capabilities, CharacteristicPath, ConnectionHandle, GattCharacteristic, GattService, GattStatus,
};
use crate::utils::lock;

type CharacteristicCache = Arc<Mutex<HashMap<CharacteristicPath, Characteristic>>>;

pub struct BluestCentralLink {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    scanner: tokio::sync::Mutex<BluetoothScanner>,
    characteristics: CharacteristicCache,
    subscriptions: Mutex<HashMap<CharacteristicPath, CancellationToken>>,
    watchers: Mutex<HashMap<String, CancellationToken>>,
    next_handle: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<CentralEvent>,
}

impl BluestCentralLink {
    pub async fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CentralEvent>), BleError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BleError::AdapterUnavailable("No Bluetooth adapter found".to_string()))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available");

        let (events, rx) = mpsc::unbounded_channel();
        let devices = Arc::new(Mutex::new(HashMap::new()));
        let scanner = BluetoothScanner::new(adapter.clone(), devices.clone(), events.clone());

        let link = Arc::new(Self {
            adapter,
            devices,
            scanner: tokio::sync::Mutex::new(scanner),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            next_handle: Arc::new(AtomicU64::new(1)),
            events,
        });
        Ok((link, rx))
    }

    fn device(&self, address: &str) -> Result<Device, BleError> {
        lock(&self.devices)
            .get(address)
            .cloned()
            .ok_or_else(|| BleError::UnknownDevice(address.to_string()))
    }

    fn characteristic(&self, path: &CharacteristicPath) -> Result<Characteristic, BleError> {
        lock(&self.characteristics)
            .get(path)
            .cloned()
            .ok_or(BleError::UnknownCharacteristic(path.characteristic))
    }

    fn stop_watcher(&self, address: &str) {
        if let Some(token) = lock(&self.watchers).remove(address) {
            token.cancel();
        }
    }
}

fn capabilities(properties: &CharacteristicProperties) -> Capabilities {
    let mut capabilities = Capabilities::NONE;
    if properties.read {
        capabilities = capabilities | Capabilities::READ;
    }
    if properties.write {
        capabilities = capabilities | Capabilities::WRITE;
    }
    if properties.write_without_response {
        capabilities = capabilities | Capabilities::WRITE_NO_RESPONSE;
    }
    if properties.notify {
        capabilities = capabilities | Capabilities::NOTIFY;
    }
    if properties.indicate {
        capabilities = capabilities | Capabilities::INDICATE;
    }
    if properties.authenticated_signed_writes {
        capabilities = capabilities | Capabilities::SIGNED_WRITE;
    }
    capabilities
}

async fn discover(
    address: &str,
    device: &Device,
) -> Result<(Vec<GattService>, Vec<(CharacteristicPath, Characteristic)>), bluest::Error> {
    let mut services = Vec::new();
    let mut handles = Vec::new();

    for service in device.services().await? {
        let mut gatt_service = GattService {
            uuid: service.uuid(),
            is_primary: service.is_primary().await.unwrap_or(true),
            characteristics: Vec::new(),
        };

        for characteristic in service.characteristics().await? {
            let capabilities = capabilities(&characteristic.properties().await?);
            let mut chr = GattCharacteristic::new(service.uuid(), characteristic.uuid(), capabilities);
            for descriptor in characteristic.descriptors().await.unwrap_or_default() {
                chr = chr.with_descriptor(descriptor.uuid());
            }
            // BlueZ and CoreBluetooth own the CCCD and may not list it.
            let notifiable = capabilities.contains(Capabilities::NOTIFY) || capabilities.contains(Capabilities::INDICATE);
            if notifiable && chr.cccd().is_none() {
                chr = chr.with_descriptor(UUID_CCCD);
            }

            handles.push((
                CharacteristicPath::new(address, service.uuid(), characteristic.uuid()),
                characteristic,
            ));
            gatt_service.characteristics.push(chr);
        }
        services.push(gatt_service);
    }
    Ok((services, handles))
}

async fn watch_connection(
    address: String,
    device: Device,
    events: mpsc::UnboundedSender<CentralEvent>,
    cancel_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(CONNECTION_POLL_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = interval.tick() => {
                if !device.is_connected().await {
                    info!("Device {} is no longer connected", address);
                    let _ = events.send(CentralEvent::ConnectionStateChanged {
                        address,
                        status: GattStatus::Success,
                        state: LinkState::Disconnected,
                        handle: None,
                    });
                    return;
                }
            }
        }
    }
}

async fn forward_notifications(
    characteristic: Characteristic,
    path: CharacteristicPath,
    events: mpsc::UnboundedSender<CentralEvent>,
    cancel_token: CancellationToken,
    ready: oneshot::Sender<Result<(), BleError>>,
) {
    let mut notification_stream = match characteristic.notify().await {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = notification_stream.next() => match result {
                Some(Ok(value)) => {
                    let _ = events.send(CentralEvent::Notification { path: path.clone(), value });
                }
                Some(Err(e)) => error!("Error in notification stream of {}: {}", path, e),
                None => break,
            },
        }
    }
    info!("Notification stream of {} ended", path);
}

#[async_trait]
impl CentralLink for BluestCentralLink {
    async fn start_scan(&self) -> Result<(), BleError> {
        self.scanner.lock().await.start_scan().await
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanner.lock().await.stop_scan().await;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<(), BleError> {
        let device = self.device(address)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let next_handle = self.next_handle.clone();
        let watcher = CancellationToken::new();
        if let Some(previous) = lock(&self.watchers).insert(address.to_string(), watcher.clone()) {
            previous.cancel();
        }

        let address = address.to_string();
        tokio::spawn(async move {
            let result = if device.is_connected().await {
                Ok(())
            } else {
                info!("Initiating connection to {}...", address);
                adapter.connect_device(&device).await
            };

            match result {
                Ok(()) => {
                    let handle = ConnectionHandle(next_handle.fetch_add(1, Ordering::Relaxed));
                    let _ = events.send(CentralEvent::ConnectionStateChanged {
                        address: address.clone(),
                        status: GattStatus::Success,
                        state: LinkState::Connected,
                        handle: Some(handle),
                    });
                    watch_connection(address, device, events, watcher).await;
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    let _ = events.send(CentralEvent::ConnectionStateChanged {
                        address,
                        status: GattStatus::Failure(e.to_string()),
                        state: LinkState::Disconnected,
                        handle: None,
                    });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), BleError> {
        let device = self.device(address)?;
        self.stop_watcher(address);
        if device.is_connected().await {
            self.adapter.disconnect_device(&device).await?;
        } else {
            debug!("Device {} was not connected", address);
        }
        let _ = self.events.send(CentralEvent::ConnectionStateChanged {
            address: address.to_string(),
            status: GattStatus::Success,
            state: LinkState::Disconnected,
            handle: None,
        });
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<(), BleError> {
        let device = self.device(address)?;
        let characteristics = self.characteristics.clone();
        let events = self.events.clone();
        let address = address.to_string();

        tokio::spawn(async move {
            let event = match discover(&address, &device).await {
                Ok((services, handles)) => {
                    lock(&characteristics).extend(handles);
                    CentralEvent::ServicesDiscovered {
                        address,
                        status: GattStatus::Success,
                        services,
                    }
                }
                Err(e) => CentralEvent::ServicesDiscovered {
                    address,
                    status: GattStatus::Failure(e.to_string()),
                    services: Vec::new(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn write_descriptor(&self, path: &CharacteristicPath, value: CccdValue) -> Result<(), BleError> {
        if !value.is_enable() {
            if let Some(token) = lock(&self.subscriptions).remove(path) {
                token.cancel();
            }
            return Ok(());
        }

        let characteristic = self.characteristic(path)?;
        let cancel_token = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(forward_notifications(
            characteristic,
            path.clone(),
            self.events.clone(),
            cancel_token.clone(),
            ready_tx,
        ));
        ready_rx
            .await
            .map_err(|_| BleError::Operation(format!("notification task for {} ended early", path)))??;

        if let Some(previous) = lock(&self.subscriptions).insert(path.clone(), cancel_token) {
            previous.cancel();
        }
        Ok(())
    }

    async fn write_without_response(&self, path: &CharacteristicPath, data: &[u8]) -> Result<(), BleError> {
        let characteristic = self.characteristic(path)?;
        characteristic.write_without_response(data).await?;
        Ok(())
    }

    async fn release(&self, address: &str) {
        self.stop_watcher(address);
        lock(&self.subscriptions).retain(|path, token| {
            if path.address == address {
                token.cancel();
                false
            } else {
                true
            }
        });
        lock(&self.characteristics).retain(|path, _| path.address != address);
    }
}

