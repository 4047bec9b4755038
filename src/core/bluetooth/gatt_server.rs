//! Peripheral link over BlueZ
//! The relay service is registered as a BlueZ GATT application. Write
//! callbacks are turned into `WriteRequest` events and parked until the
//! engine answers through `send_response`. BlueZ owns the CCCD and fans a
//! notification out to every subscribed central, so one notify session per
//! characteristic serves all peers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod, ReqError, Service,
};
use bluer::gatt::WriteOp;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ble_config::AdvertiseSetting;
use crate::core::bluetooth::constants::{CONNECTION_POLL_INTERVAL_MS, WRITE_RESPONSE_TIMEOUT_MS};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::link::{PeripheralEvent, PeripheralLink, WriteResponse};
use crate::core::bluetooth::types::{Capabilities, GattCharacteristic, GattService};
use crate::utils::lock;

type PendingResponses = Arc<Mutex<HashMap<u64, oneshot::Sender<WriteResponse>>>>;
type Notifiers = Arc<tokio::sync::Mutex<HashMap<Uuid, CharacteristicNotifier>>>;

impl From<bluer::Error> for BleError {
    fn from(e: bluer::Error) -> Self {
        BleError::Operation(e.to_string())
    }
}

pub struct BluezPeripheralLink {
    adapter: bluer::Adapter,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    application: Mutex<Option<ApplicationHandle>>,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    pending: PendingResponses,
    notifiers: Notifiers,
    next_request_id: Arc<AtomicU64>,
    cancel_token: CancellationToken,
}

impl BluezPeripheralLink {
    pub async fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<PeripheralEvent>), BleError> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("Using Bluetooth adapter {} ({})", adapter.name(), adapter.address().await?);

        let (events, rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        tokio::spawn(track_peers(adapter.clone(), events.clone(), cancel_token.clone()));

        let link = Arc::new(Self {
            adapter,
            events,
            application: Mutex::new(None),
            advertisement: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            notifiers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            next_request_id: Arc::new(AtomicU64::new(1)),
            cancel_token,
        });
        Ok((link, rx))
    }

    fn characteristic(&self, chr: &GattCharacteristic) -> Characteristic {
        let capabilities = chr.capabilities;
        let write = (capabilities.contains(Capabilities::WRITE)
            || capabilities.contains(Capabilities::WRITE_NO_RESPONSE))
        .then(|| CharacteristicWrite {
            write: capabilities.contains(Capabilities::WRITE),
            write_without_response: capabilities.contains(Capabilities::WRITE_NO_RESPONSE),
            method: self.write_method(chr.uuid),
            ..Default::default()
        });
        let notify = capabilities.contains(Capabilities::NOTIFY).then(|| CharacteristicNotify {
            notify: true,
            method: self.notify_method(chr.uuid),
            ..Default::default()
        });

        Characteristic {
            uuid: chr.uuid,
            write,
            notify,
            ..Default::default()
        }
    }

    fn write_method(&self, characteristic: Uuid) -> CharacteristicWriteMethod {
        let events = self.events.clone();
        let pending = self.pending.clone();
        let next_request_id = self.next_request_id.clone();

        CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
            let events = events.clone();
            let pending = pending.clone();
            let request_id = next_request_id.fetch_add(1, Ordering::Relaxed);
            async move {
                let response_needed = request.op_type == WriteOp::Request;
                let (tx, rx) = oneshot::channel();
                if response_needed {
                    lock(&pending).insert(request_id, tx);
                }
                let event = PeripheralEvent::WriteRequest {
                    address: request.device_address.to_string(),
                    request_id,
                    characteristic,
                    value,
                    response_needed,
                };
                if events.send(event).is_err() {
                    lock(&pending).remove(&request_id);
                    return Err(ReqError::Failed);
                }
                if !response_needed {
                    return Ok(());
                }

                match tokio::time::timeout(Duration::from_millis(WRITE_RESPONSE_TIMEOUT_MS), rx).await {
                    Ok(Ok(WriteResponse::Success)) => Ok(()),
                    Ok(Ok(WriteResponse::WriteNotPermitted)) => Err(ReqError::NotPermitted),
                    _ => {
                        lock(&pending).remove(&request_id);
                        warn!("Write request {} was not answered", request_id);
                        Err(ReqError::Failed)
                    }
                }
            }
            .boxed()
        }))
    }

    fn notify_method(&self, characteristic: Uuid) -> CharacteristicNotifyMethod {
        let notifiers = self.notifiers.clone();
        CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
            let notifiers = notifiers.clone();
            async move {
                debug!("Central subscribed to {}", characteristic);
                notifiers.lock().await.insert(characteristic, notifier);
            }
            .boxed()
        }))
    }
}

impl Drop for BluezPeripheralLink {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Polls the adapter for connected devices and reports the differences.
async fn track_peers(
    adapter: bluer::Adapter,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    cancel_token: CancellationToken,
) {
    let mut known: HashSet<bluer::Address> = HashSet::new();
    let mut interval = tokio::time::interval(Duration::from_millis(CONNECTION_POLL_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = interval.tick() => {}
        }

        let addresses = match adapter.device_addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                error!("Failed to list devices: {}", e);
                continue;
            }
        };

        let mut connected = HashSet::new();
        for address in addresses {
            let Ok(device) = adapter.device(address) else {
                continue;
            };
            if !device.is_connected().await.unwrap_or(false) {
                continue;
            }
            connected.insert(address);
            if !known.contains(&address) {
                let name = device.name().await.ok().flatten();
                let _ = events.send(PeripheralEvent::PeerConnected {
                    address: address.to_string(),
                    name,
                });
            }
        }
        for gone in known.difference(&connected) {
            let _ = events.send(PeripheralEvent::PeerDisconnected {
                address: gone.to_string(),
            });
        }
        known = connected;
    }
}

#[async_trait]
impl PeripheralLink for BluezPeripheralLink {
    async fn open_server(&self, services: &[GattService]) -> Result<(), BleError> {
        let application = Application {
            services: services
                .iter()
                .map(|service| Service {
                    uuid: service.uuid,
                    primary: service.is_primary,
                    characteristics: service.characteristics.iter().map(|c| self.characteristic(c)).collect(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let handle = self.adapter.serve_gatt_application(application).await?;
        info!("GATT application registered with {} services", services.len());
        if lock(&self.application).replace(handle).is_some() {
            debug!("Replaced previous GATT application");
        }
        Ok(())
    }

    async fn close_server(&self) -> Result<(), BleError> {
        // Dropping the handle unregisters the application.
        drop(lock(&self.application).take());
        self.notifiers.lock().await.clear();
        lock(&self.pending).clear();
        Ok(())
    }

    async fn cancel_connection(&self, address: &str) -> Result<(), BleError> {
        let address: bluer::Address = address
            .parse()
            .map_err(|_| BleError::UnknownDevice(address.to_string()))?;
        self.adapter.device(address)?.disconnect().await?;
        Ok(())
    }

    async fn start_advertising(&self, setting: &AdvertiseSetting, service: Uuid) -> Result<(), BleError> {
        let interval = setting.mode.interval();
        let advertisement = Advertisement {
            advertisement_type: if setting.connectable { Type::Peripheral } else { Type::Broadcast },
            service_uuids: BTreeSet::from([service]),
            discoverable: Some(true),
            local_name: setting.include_device_name.then(|| self.adapter.name().to_string()),
            tx_power: Some(setting.tx_power.dbm()),
            timeout: setting.timeout(),
            min_interval: Some(interval),
            max_interval: Some(interval),
            ..Default::default()
        };

        let event = match self.adapter.advertise(advertisement).await {
            Ok(handle) => {
                *lock(&self.advertisement) = Some(handle);
                PeripheralEvent::AdvertiseStarted { setting: setting.clone() }
            }
            Err(e) => PeripheralEvent::AdvertiseFailed { reason: e.to_string() },
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        drop(lock(&self.advertisement).take());
        Ok(())
    }

    async fn send_response(&self, address: &str, request_id: u64, response: WriteResponse) -> Result<(), BleError> {
        let sender = lock(&self.pending)
            .remove(&request_id)
            .ok_or_else(|| BleError::Operation(format!("no pending write {} from {}", request_id, address)))?;
        sender
            .send(response)
            .map_err(|_| BleError::Operation(format!("write {} from {} already timed out", request_id, address)))
    }

    async fn notify(
        &self,
        peers: &[String],
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<(String, Result<(), BleError>)> {
        let mut notifiers = self.notifiers.lock().await;
        let result = match notifiers.get_mut(&characteristic) {
            Some(notifier) if !notifier.is_stopped() => notifier
                .notify(value.to_vec())
                .await
                .map_err(|e| BleError::Operation(e.to_string())),
            _ => {
                notifiers.remove(&characteristic);
                Err(BleError::Operation(format!("no central subscribed to {}", characteristic)))
            }
        };
        peers.iter().map(|peer| (peer.clone(), result.clone())).collect()
    }
}
