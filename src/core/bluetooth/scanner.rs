use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::link::CentralEvent;
use crate::utils::{extract_mac_address, lock};

/// Runs a cancellable scan task that posts every sighting as a `ScanResult`
/// and remembers the platform device behind each address.
pub struct BluetoothScanner {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    events: mpsc::UnboundedSender<CentralEvent>,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        events: mpsc::UnboundedSender<CentralEvent>,
    ) -> Self {
        Self {
            adapter,
            devices,
            events,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub async fn start_scan(&mut self) -> Result<(), BleError> {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await;
        }

        self.cancel_token = CancellationToken::new();
        let cancel_token = self.cancel_token.clone();
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let events = self.events.clone();

        self.scan_task_handle = Some(tokio::spawn(async move {
            if let Err(e) = Self::internal_scan_task(adapter, devices, events.clone(), cancel_token).await {
                error!("Bluetooth scan failed: {}", e);
                let _ = events.send(CentralEvent::ScanFailed { reason: e.to_string() });
            }
        }));
        info!("Device scan task started.");
        Ok(())
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        events: mpsc::UnboundedSender<CentralEvent>,
        cancel_token: CancellationToken,
    ) -> Result<(), BleError> {
        // Devices already connected to the host do not advertise.
        for device in adapter.connected_devices().await? {
            Self::report(&devices, &events, device, None, None);
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&[]).await?;
        loop {
            tokio::select! {
                result = scan_stream.next() => match result {
                    Some(discovered) => {
                        debug!("Found device - Device: {:?}, RSSI: {:?}", discovered.device, discovered.rssi);
                        Self::report(
                            &devices,
                            &events,
                            discovered.device,
                            discovered.adv_data.local_name,
                            discovered.rssi,
                        );
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    }
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }

    fn report(
        devices: &Mutex<HashMap<String, Device>>,
        events: &mpsc::UnboundedSender<CentralEvent>,
        device: Device,
        advertised_name: Option<String>,
        rssi: Option<i16>,
    ) {
        let id = device.id().to_string();
        let address = extract_mac_address(&id).unwrap_or(id);
        let name = advertised_name.or_else(|| device.name().ok());

        lock(devices).insert(address.clone(), device);
        let _ = events.send(CentralEvent::ScanResult { address, name, rssi });
    }

    pub async fn stop_scan(&mut self) {
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            info!("Waiting for scan task to finish...");
            match handle.await {
                Ok(()) => info!("Scan task finished after cancellation."),
                Err(e) => {
                    if e.is_cancelled() {
                        info!("Scan task was cancelled successfully.");
                    } else {
                        error!("Scan task finished with an unexpected join error: {:?}", e);
                    }
                }
            }
        }
    }
}
