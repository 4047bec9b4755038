//! Application state management
//! Builds the settings store, the MQTT service, the BLE role engine selected
//! by the settings and the bridge, binds them into the bridge and drives
//! their start-up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ble_config::BleRole;
use crate::config::SettingsStore;
use crate::core::bluetooth::central::CentralEngine;
use crate::core::bluetooth::constants::UUID_RELAY_WRITE_CHAR;
use crate::core::bluetooth::link::{PeripheralEvent, PeripheralLink};
use crate::core::bluetooth::peripheral::PeripheralEngine;
use crate::core::bluetooth::registry::RegistrySnapshot;
use crate::core::bluetooth::simulated::{
    demo_topology, SimulatedCentralLink, SimulatedPeripheralLink, DEMO_NOTIFY_CHAR, DEMO_SERVICE, DEMO_WRITE_CHAR,
};
use crate::core::bluetooth::types::{CharacteristicPath, ConnectionPhase, DisconnectReason};
use crate::core::bluetooth::BluestCentralLink;
use crate::core::bridge::{BleEndpoint, BridgeOrchestrator};
use crate::core::mqtt::{BrokerLink, MqttService, MqttTransport, RumqttcLink, SimulatedBrokerLink};
use crate::core::ServiceState;

const DEMO_DEVICE_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const DEMO_DEVICE_NAME: &str = "Demo Sensor";
const DEMO_TOPIC: &str = "relay/demo";
const DEMO_INTERVAL_SECS: u64 = 5;
const SHUTDOWN_TIMEOUT_SECS: u64 = 3;

/// Where the radio and broker links come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Hardware,
    /// In-memory links with a demo peer and broker traffic.
    Simulated,
}

/// Devices the central role connects to on its own, and the characteristics
/// it enables or selects once their services are known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CentralTargets {
    pub devices: Vec<String>,
    pub notify: Vec<Uuid>,
    pub write: Vec<Uuid>,
}

impl CentralTargets {
    fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn wants(&self, address: &str) -> bool {
        self.devices.iter().any(|d| d.eq_ignore_ascii_case(address))
    }
}

pub enum RoleEngine {
    Central(Arc<CentralEngine>),
    Peripheral(Arc<PeripheralEngine>),
}

impl RoleEngine {
    pub fn endpoint(&self) -> Arc<dyn BleEndpoint> {
        match self {
            RoleEngine::Central(engine) => engine.clone(),
            RoleEngine::Peripheral(engine) => engine.clone(),
        }
    }
}

/// Global application state
pub struct AppState {
    pub settings: SettingsStore,
    pub mqtt: Arc<MqttService>,
    pub role: RoleEngine,
    pub bridge: BridgeOrchestrator,
    targets: CentralTargets,
    demo: Option<DemoLinks>,
    cancel_token: CancellationToken,
}

/// Simulated links kept around to feed demo traffic.
struct DemoLinks {
    broker: Arc<SimulatedBrokerLink>,
    central: Option<Arc<SimulatedCentralLink>>,
    peripheral: Option<Arc<SimulatedPeripheralLink>>,
}

impl AppState {
    pub async fn new(config_dir: PathBuf, role: Option<BleRole>, backend: Backend, targets: CentralTargets) -> Result<Self> {
        let settings = SettingsStore::load(config_dir).await?;
        if let Some(role) = role {
            if settings.current_ble_config().role != role {
                info!("Switching BLE role to {:?}", role);
                settings.update_ble_config(|c| c.role = role).await?;
            }
        }
        let role = settings.current_ble_config().role;

        let (broker_link, broker_events, demo_broker) = match backend {
            Backend::Hardware => {
                let (link, events) = RumqttcLink::new();
                (link as Arc<dyn BrokerLink>, events, None)
            }
            Backend::Simulated => {
                let (link, events) = SimulatedBrokerLink::new();
                (link.clone() as Arc<dyn BrokerLink>, events, Some(link))
            }
        };
        let mqtt = Arc::new(MqttService::new(broker_link, broker_events, settings.mqtt_config()));

        let mut demo_central = None;
        let mut demo_peripheral = None;
        let role_engine = match (role, backend) {
            (BleRole::Central, Backend::Hardware) => {
                let (link, events) = BluestCentralLink::new().await?;
                RoleEngine::Central(Arc::new(CentralEngine::new(link, events)))
            }
            (BleRole::Central, Backend::Simulated) => {
                let (link, events) = SimulatedCentralLink::new();
                link.add_peripheral(DEMO_DEVICE_ADDRESS, Some(DEMO_DEVICE_NAME), demo_topology());
                demo_central = Some(link.clone());
                RoleEngine::Central(Arc::new(CentralEngine::new(link, events)))
            }
            (BleRole::Peripheral, Backend::Hardware) => {
                let (link, events) = hardware_peripheral_link().await?;
                RoleEngine::Peripheral(Arc::new(PeripheralEngine::new(link, events, settings.ble_config())))
            }
            (BleRole::Peripheral, Backend::Simulated) => {
                let (link, events) = SimulatedPeripheralLink::new();
                demo_peripheral = Some(link.clone());
                RoleEngine::Peripheral(Arc::new(PeripheralEngine::new(link, events, settings.ble_config())))
            }
        };

        let targets = match (&role_engine, backend) {
            (RoleEngine::Central(_), Backend::Simulated) if targets.is_empty() => CentralTargets {
                devices: vec![DEMO_DEVICE_ADDRESS.to_string()],
                notify: vec![DEMO_NOTIFY_CHAR],
                write: vec![DEMO_WRITE_CHAR],
            },
            _ => targets,
        };

        let bridge = BridgeOrchestrator::new();
        bridge.set_mqtt(Some(mqtt.clone()));
        match &role_engine {
            RoleEngine::Central(_) => bridge.set_central(Some(role_engine.endpoint())),
            RoleEngine::Peripheral(_) => bridge.set_peripheral(Some(role_engine.endpoint())),
        }

        Ok(Self {
            settings,
            mqtt,
            role: role_engine,
            bridge,
            targets,
            demo: demo_broker.map(|broker| DemoLinks {
                broker,
                central: demo_central,
                peripheral: demo_peripheral,
            }),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Starts every service and connects to the broker.
    pub fn start(&self) {
        self.mqtt.start_service();
        self.mqtt.connect_to_broker();

        match &self.role {
            RoleEngine::Central(engine) => {
                engine.start_service();
                engine.scan_devices();
                if !self.targets.is_empty() {
                    tokio::spawn(drive_central(
                        engine.clone(),
                        self.targets.clone(),
                        self.cancel_token.child_token(),
                    ));
                }
            }
            RoleEngine::Peripheral(engine) => {
                engine.start_service();
                engine.open_gatt_server();
                engine.advertise_service();
            }
        }

        if let Some(demo) = &self.demo {
            tokio::spawn(feed_demo_traffic(
                demo.broker.clone(),
                demo.central.clone(),
                demo.peripheral.clone(),
                self.settings.current_mqtt_config().topic_filters.first().map(|f| f.topic.clone()),
                self.cancel_token.child_token(),
            ));
        }
        info!("Relay started");
    }

    /// Stops the role engine and the MQTT service and unbinds them from the bridge.
    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.cancel_token.cancel();

        let role_state = match &self.role {
            RoleEngine::Central(engine) => {
                engine.stop_service();
                engine.service_state()
            }
            RoleEngine::Peripheral(engine) => {
                engine.stop_service();
                engine.service_state()
            }
        };
        self.mqtt.stop_service();

        let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        wait_stopped("BLE role", role_state, timeout).await;
        wait_stopped("MQTT", self.mqtt.service_state(), timeout).await;

        self.bridge.set_central(None);
        self.bridge.set_peripheral(None);
        self.bridge.set_mqtt(None);
        info!("Relay stopped");
    }
}

async fn wait_stopped(name: &str, mut state: watch::Receiver<ServiceState>, timeout: Duration) {
    match tokio::time::timeout(timeout, state.wait_for(|s| !s.is_running())).await {
        Ok(Ok(_)) => debug!("{} service stopped", name),
        Ok(Err(_)) => debug!("{} service already gone", name),
        Err(_) => warn!("{} service did not stop within {:?}", name, timeout),
    }
}

#[cfg(target_os = "linux")]
async fn hardware_peripheral_link() -> Result<(Arc<dyn PeripheralLink>, tokio::sync::mpsc::UnboundedReceiver<PeripheralEvent>)> {
    let (link, events) = crate::core::bluetooth::BluezPeripheralLink::new().await?;
    Ok((link, events))
}

#[cfg(not(target_os = "linux"))]
async fn hardware_peripheral_link() -> Result<(Arc<dyn PeripheralLink>, tokio::sync::mpsc::UnboundedReceiver<PeripheralEvent>)> {
    Err(anyhow::anyhow!(crate::core::bluetooth::BleError::Unsupported(
        "the peripheral role needs BlueZ".to_string()
    )))
}

/// Connects to the target devices as they show up, reconnects after an
/// unexpected loss and applies the characteristic targets once services are known.
async fn drive_central(engine: Arc<CentralEngine>, targets: CentralTargets, cancel_token: CancellationToken) {
    let mut devices = engine.devices();
    let mut phases: HashMap<String, ConnectionPhase> = HashMap::new();
    loop {
        let snapshot = devices.borrow_and_update().clone();
        apply_targets(&engine, &targets, &snapshot, &mut phases);

        tokio::select! {
            _ = cancel_token.cancelled() => return,
            changed = devices.changed() => if changed.is_err() { return },
        }
    }
}

fn apply_targets(
    engine: &CentralEngine,
    targets: &CentralTargets,
    snapshot: &RegistrySnapshot,
    phases: &mut HashMap<String, ConnectionPhase>,
) {
    for device in snapshot.devices().iter().filter(|d| targets.wants(&d.address)) {
        let previous = phases.insert(device.address.clone(), device.phase);
        if previous == Some(device.phase) {
            continue;
        }
        match device.phase {
            ConnectionPhase::Discovered => {
                info!("Target {} found, connecting", device.address);
                engine.connect_to_device(device);
            }
            ConnectionPhase::Disconnected if device.last_disconnect == Some(DisconnectReason::Unexpected) => {
                info!("Target {} lost, reconnecting", device.address);
                engine.connect_to_device(device);
            }
            ConnectionPhase::ServicesDiscovered => {
                for characteristic in device.services.iter().flat_map(|s| s.characteristics.iter()) {
                    if targets.notify.contains(&characteristic.uuid) {
                        engine.enable_notification(device, characteristic);
                    }
                    if targets.write.contains(&characteristic.uuid) {
                        engine.select_writeable_characteristic(device, characteristic);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Generates traffic on the simulated links so both bridge directions move.
async fn feed_demo_traffic(
    broker: Arc<SimulatedBrokerLink>,
    central: Option<Arc<SimulatedCentralLink>>,
    peripheral: Option<Arc<SimulatedPeripheralLink>>,
    broker_topic: Option<String>,
    cancel_token: CancellationToken,
) {
    const DEMO_PEER: &str = "11:22:33:44:55:66";
    if let Some(peripheral) = &peripheral {
        peripheral.connect_peer(DEMO_PEER, Some("Demo Central"));
    }

    let broker_topic = broker_topic.unwrap_or_else(|| DEMO_TOPIC.to_string());
    let notify_path = CharacteristicPath::new(DEMO_DEVICE_ADDRESS, DEMO_SERVICE, DEMO_NOTIFY_CHAR);
    let mut interval = tokio::time::interval(Duration::from_secs(DEMO_INTERVAL_SECS));
    let mut counter: u8 = 0;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = interval.tick() => {}
        }
        counter = counter.wrapping_add(1);

        if let Some(central) = &central {
            if !central.push_notification(&notify_path, &[0x00, counter]) {
                debug!("Demo notification dropped, {} is not subscribed", notify_path);
            }
        }
        if let Some(peripheral) = &peripheral {
            peripheral.write(DEMO_PEER, UUID_RELAY_WRITE_CHAR, &[counter], true);
        }
        broker.deliver(&broker_topic, format!("demo {}", counter).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_match_addresses_case_insensitively() {
        let targets = CentralTargets {
            devices: vec!["aa:bb:cc:dd:ee:ff".to_string()],
            ..CentralTargets::default()
        };
        assert!(targets.wants("AA:BB:CC:DD:EE:FF"));
        assert!(!targets.wants("11:22:33:44:55:66"));
    }

    #[tokio::test]
    async fn test_simulated_central_relays_demo_device() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path().to_path_buf(), Some(BleRole::Central), Backend::Simulated, CentralTargets::default())
            .await
            .unwrap();
        state.start();

        let RoleEngine::Central(engine) = &state.role else {
            panic!("central role expected");
        };
        let mut devices = engine.devices();
        tokio::time::timeout(
            Duration::from_secs(2),
            devices.wait_for(|snapshot| {
                snapshot.get(DEMO_DEVICE_ADDRESS).is_some_and(|d| {
                    d.phase == ConnectionPhase::ServicesDiscovered
                        && d.characteristic(DEMO_SERVICE, DEMO_NOTIFY_CHAR).is_some_and(|c| c.selected)
                        && d.characteristic(DEMO_SERVICE, DEMO_WRITE_CHAR).is_some_and(|c| c.selected)
                })
            }),
        )
        .await
        .unwrap()
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), state.bridge.service_state().wait_for(|s| s.is_running()))
            .await
            .unwrap()
            .unwrap();

        state.shutdown().await;
        assert!(!engine.service_state().borrow().is_running());
    }

    #[tokio::test]
    async fn test_role_override_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path().to_path_buf(), Some(BleRole::Central), Backend::Simulated, CentralTargets::default())
            .await
            .unwrap();
        assert!(matches!(state.role, RoleEngine::Central(_)));

        let reloaded = SettingsStore::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.current_ble_config().role, BleRole::Central);
    }
}
