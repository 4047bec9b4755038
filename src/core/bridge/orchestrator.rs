//! Bridge orchestrator
//! Services are bound late through setters. For each BLE role a supervisor
//! keeps exactly one relay alive for the current (broker, engine) pair and
//! restarts it only when one of the two instances is replaced. A separate
//! task derives readiness from the services' states and starts or stops the
//! bridge on each edge.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::core::bridge::event_log::BridgeLog;
use crate::core::bridge::BleEndpoint;
use crate::core::mqtt::transport::{MqttConnectionState, MqttTransport};
use crate::core::service_state::ServiceState;

type MqttSlot = watch::Receiver<Option<Arc<dyn MqttTransport>>>;
type EndpointSlot = watch::Receiver<Option<Arc<dyn BleEndpoint>>>;

struct BridgeShared {
    service_state: watch::Sender<ServiceState>,
    log: BridgeLog,
}

impl BridgeShared {
    fn start(&self) {
        if self.service_state.borrow().is_running() {
            return;
        }
        self.log.info("Starting bridge service");
        self.service_state.send_replace(ServiceState::Running);
    }

    fn stop(&self) {
        if !self.service_state.borrow().is_running() {
            return;
        }
        self.log.info("Stopping bridge service");
        self.service_state.send_replace(ServiceState::Stopped);
    }
}

pub struct BridgeOrchestrator {
    mqtt: watch::Sender<Option<Arc<dyn MqttTransport>>>,
    peripheral: watch::Sender<Option<Arc<dyn BleEndpoint>>>,
    central: watch::Sender<Option<Arc<dyn BleEndpoint>>>,
    shared: Arc<BridgeShared>,
    cancel_token: CancellationToken,
}

impl BridgeOrchestrator {
    pub fn new() -> Self {
        let (mqtt, _) = watch::channel(None);
        let (peripheral, _) = watch::channel(None);
        let (central, _) = watch::channel(None);
        let (service_state, _) = watch::channel(ServiceState::Stopped);
        let shared = Arc::new(BridgeShared {
            service_state,
            log: BridgeLog::new(),
        });
        let cancel_token = CancellationToken::new();

        tokio::spawn(supervise_relays(
            mqtt.subscribe(),
            peripheral.subscribe(),
            shared.clone(),
            cancel_token.clone(),
        ));
        tokio::spawn(supervise_relays(
            mqtt.subscribe(),
            central.subscribe(),
            shared.clone(),
            cancel_token.clone(),
        ));
        tokio::spawn(supervise_readiness(
            mqtt.subscribe(),
            peripheral.subscribe(),
            central.subscribe(),
            shared.clone(),
            cancel_token.clone(),
        ));
        tokio::spawn(report_broker_connection(
            mqtt.subscribe(),
            shared.clone(),
            cancel_token.clone(),
        ));

        Self {
            mqtt,
            peripheral,
            central,
            shared,
            cancel_token,
        }
    }

    pub fn set_mqtt(&self, mqtt: Option<Arc<dyn MqttTransport>>) {
        self.mqtt.send_replace(mqtt);
    }

    pub fn set_peripheral(&self, peripheral: Option<Arc<dyn BleEndpoint>>) {
        self.peripheral.send_replace(peripheral);
    }

    pub fn set_central(&self, central: Option<Arc<dyn BleEndpoint>>) {
        self.central.send_replace(central);
    }

    pub fn service_state(&self) -> watch::Receiver<ServiceState> {
        self.shared.service_state.subscribe()
    }

    pub fn log(&self) -> &BridgeLog {
        &self.shared.log
    }

    pub fn clear_logs(&self) {
        self.shared.log.clear_logs();
    }

    /// Normally driven by readiness; exposed for manual control.
    pub fn start_service(&self) {
        self.shared.start();
    }

    pub fn stop_service(&self) {
        self.shared.stop();
    }
}

impl Default for BridgeOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BridgeOrchestrator {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Resolves when `rx` changes; never resolves for an absent or closed receiver.
async fn changed_or_pending<T>(rx: &mut Option<watch::Receiver<T>>) {
    if let Some(rx) = rx {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn is_running(rx: &mut Option<watch::Receiver<ServiceState>>) -> bool {
    rx.as_mut()
        .is_some_and(|rx| rx.borrow_and_update().is_running())
}

struct Relay {
    mqtt: Arc<dyn MqttTransport>,
    endpoint: Arc<dyn BleEndpoint>,
    cancel_token: CancellationToken,
}

impl Relay {
    fn serves(&self, mqtt: &Arc<dyn MqttTransport>, endpoint: &Arc<dyn BleEndpoint>) -> bool {
        Arc::ptr_eq(&self.mqtt, mqtt) && Arc::ptr_eq(&self.endpoint, endpoint)
    }
}

async fn supervise_relays(
    mut mqtt_slot: MqttSlot,
    mut endpoint_slot: EndpointSlot,
    shared: Arc<BridgeShared>,
    cancel_token: CancellationToken,
) {
    let mut current: Option<Relay> = None;
    loop {
        let candidate = match (
            mqtt_slot.borrow_and_update().clone(),
            endpoint_slot.borrow_and_update().clone(),
        ) {
            (Some(mqtt), Some(endpoint)) => Some((mqtt, endpoint)),
            _ => None,
        };

        let unchanged = match (&current, &candidate) {
            (Some(relay), Some((mqtt, endpoint))) => relay.serves(mqtt, endpoint),
            (None, None) => true,
            _ => false,
        };
        if !unchanged {
            if let Some(relay) = current.take() {
                relay.cancel_token.cancel();
                shared.log.info(format!("Stopped {} relay", relay.endpoint.name()));
            }
            if let Some((mqtt, endpoint)) = candidate {
                let relay_token = cancel_token.child_token();
                spawn_relay(&mqtt, &endpoint, &shared, &relay_token);
                shared.log.info(format!("Started {} relay", endpoint.name()));
                current = Some(Relay {
                    mqtt,
                    endpoint,
                    cancel_token: relay_token,
                });
            }
        }

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            changed = mqtt_slot.changed() => if changed.is_err() { break },
            changed = endpoint_slot.changed() => if changed.is_err() { break },
        }
    }
    if let Some(relay) = current {
        relay.cancel_token.cancel();
    }
}

/// Subscribes to both directions before returning so no payload published
/// after the relay starts is missed.
fn spawn_relay(
    mqtt: &Arc<dyn MqttTransport>,
    endpoint: &Arc<dyn BleEndpoint>,
    shared: &Arc<BridgeShared>,
    cancel_token: &CancellationToken,
) {
    tokio::spawn(pipe_broker_to_ble(
        mqtt.incoming_data(),
        endpoint.clone(),
        shared.clone(),
        cancel_token.clone(),
    ));
    tokio::spawn(pipe_ble_to_broker(
        endpoint.incoming_data(),
        endpoint.name(),
        mqtt.clone(),
        shared.clone(),
        cancel_token.clone(),
    ));
}

async fn next_payload(
    rx: &mut broadcast::Receiver<Vec<u8>>,
    cancel_token: &CancellationToken,
    source: &str,
) -> Option<Vec<u8>> {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return None,
            received = rx.recv() => match received {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Relay fell behind, skipped {} payloads from {}", skipped, source);
                }
                Err(RecvError::Closed) => return None,
            },
        }
    }
}

async fn pipe_broker_to_ble(
    mut from_broker: broadcast::Receiver<Vec<u8>>,
    endpoint: Arc<dyn BleEndpoint>,
    shared: Arc<BridgeShared>,
    cancel_token: CancellationToken,
) {
    while let Some(payload) = next_payload(&mut from_broker, &cancel_token, "broker").await {
        shared.log.info(format!("Received {} bytes from broker", payload.len()));
        endpoint.send_to_connected_devices(payload);
    }
    debug!("Broker to {} pipe finished", endpoint.name());
}

async fn pipe_ble_to_broker(
    mut from_ble: broadcast::Receiver<Vec<u8>>,
    role: &'static str,
    mqtt: Arc<dyn MqttTransport>,
    shared: Arc<BridgeShared>,
    cancel_token: CancellationToken,
) {
    while let Some(payload) = next_payload(&mut from_ble, &cancel_token, role).await {
        shared.log.info(format!("Received {} bytes from BLE devices", payload.len()));
        if let Err(e) = mqtt.send_to_broker(&payload).await {
            shared.log.warning(format!("Failed to publish {} bytes: {}", payload.len(), e));
        }
    }
    debug!("{} to broker pipe finished", role);
}

async fn supervise_readiness(
    mut mqtt_slot: MqttSlot,
    mut peripheral_slot: EndpointSlot,
    mut central_slot: EndpointSlot,
    shared: Arc<BridgeShared>,
    cancel_token: CancellationToken,
) {
    let mut ready = false;
    loop {
        let mut mqtt_state = mqtt_slot.borrow_and_update().as_ref().map(|m| m.service_state());
        let mut peripheral_state = peripheral_slot
            .borrow_and_update()
            .as_ref()
            .map(|p| p.service_state());
        let mut central_state = central_slot.borrow_and_update().as_ref().map(|c| c.service_state());

        loop {
            let now_ready = is_running(&mut mqtt_state)
                && (is_running(&mut peripheral_state) || is_running(&mut central_state));
            if now_ready != ready {
                ready = now_ready;
                if ready {
                    shared.start();
                } else {
                    shared.stop();
                }
            }

            tokio::select! {
                _ = cancel_token.cancelled() => return,
                changed = mqtt_slot.changed() => if changed.is_err() { return } else { break },
                changed = peripheral_slot.changed() => if changed.is_err() { return } else { break },
                changed = central_slot.changed() => if changed.is_err() { return } else { break },
                _ = changed_or_pending(&mut mqtt_state) => {}
                _ = changed_or_pending(&mut peripheral_state) => {}
                _ = changed_or_pending(&mut central_state) => {}
            }
        }
    }
}

fn report_connection_state(log: &BridgeLog, state: &MqttConnectionState) {
    match state {
        MqttConnectionState::Connected => log.info("Connected to broker"),
        MqttConnectionState::Disconnected => log.warning("Not connected to broker"),
        MqttConnectionState::ConnectionError(reason) => {
            log.warning(format!("Broker connection error: {}", reason))
        }
        MqttConnectionState::ConnectionTimeout => log.warning("Broker connection timed out"),
        MqttConnectionState::Connecting => {}
    }
}

async fn report_broker_connection(
    mut mqtt_slot: MqttSlot,
    shared: Arc<BridgeShared>,
    cancel_token: CancellationToken,
) {
    loop {
        let mut connection = mqtt_slot
            .borrow_and_update()
            .as_ref()
            .map(|m| m.connection_state());

        loop {
            if let Some(rx) = connection.as_mut() {
                let state = rx.borrow_and_update().clone();
                report_connection_state(&shared.log, &state);
            }

            tokio::select! {
                _ = cancel_token.cancelled() => return,
                changed = mqtt_slot.changed() => if changed.is_err() { return } else { break },
                _ = changed_or_pending(&mut connection) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::mqtt_config::{MqttConfig, PublishTopic, TopicFilter};
    use crate::core::mqtt::service::MqttService;
    use crate::core::mqtt::simulated::SimulatedBrokerLink;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct FakeEndpoint {
        name: &'static str,
        state: watch::Sender<ServiceState>,
        incoming: broadcast::Sender<Vec<u8>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeEndpoint {
        fn new(name: &'static str) -> Arc<Self> {
            let (state, _) = watch::channel(ServiceState::Stopped);
            let (incoming, _) = broadcast::channel(16);
            Arc::new(Self {
                name,
                state,
                incoming,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl BleEndpoint for FakeEndpoint {
        fn name(&self) -> &'static str {
            self.name
        }

        fn service_state(&self) -> watch::Receiver<ServiceState> {
            self.state.subscribe()
        }

        fn incoming_data(&self) -> broadcast::Receiver<Vec<u8>> {
            self.incoming.subscribe()
        }

        fn send_to_connected_devices(&self, data: Vec<u8>) {
            self.sent.lock().unwrap().push(data);
        }
    }

    fn mqtt() -> (Arc<MqttService>, Arc<SimulatedBrokerLink>) {
        let (link, events) = SimulatedBrokerLink::new();
        let config = MqttConfig {
            topic_filters: vec![TopicFilter { topic: "relay/down".to_string(), qos: 0 }],
            publish_topics: vec![PublishTopic { topic: "relay/up".to_string(), qos: 0 }],
            ..MqttConfig::default()
        };
        let (_config_tx, config_rx) = watch::channel(config);
        (Arc::new(MqttService::new(link.clone(), events, config_rx)), link)
    }

    fn count(entries: &VecDeque<crate::core::bridge::BridgeLogEntry>, message: &str) -> usize {
        entries.iter().filter(|e| e.message == message).count()
    }

    async fn wait_for_log(bridge: &BridgeOrchestrator, message: &str, times: usize) {
        timeout(WAIT, bridge.log().subscribe().wait_for(|e| count(e, message) >= times))
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_connected(mqtt: &MqttService) {
        mqtt.connect_to_broker();
        timeout(WAIT, mqtt.connection_state().wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_readiness_edges_start_and_stop_once() {
        let bridge = BridgeOrchestrator::new();
        let (mqtt, _link) = mqtt();
        let peripheral = FakeEndpoint::new("peripheral");
        let central = FakeEndpoint::new("central");
        bridge.set_mqtt(Some(mqtt.clone()));
        bridge.set_peripheral(Some(peripheral.clone()));
        bridge.set_central(Some(central.clone()));

        mqtt.start_service();
        timeout(WAIT, mqtt.service_state().wait_for(|s| s.is_running()))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*bridge.service_state().borrow(), ServiceState::Stopped);

        peripheral.state.send_replace(ServiceState::Running);
        timeout(WAIT, bridge.service_state().wait_for(|s| s.is_running()))
            .await
            .unwrap()
            .unwrap();

        mqtt.stop_service();
        timeout(WAIT, bridge.service_state().wait_for(|s| !s.is_running()))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entries = bridge.log().subscribe().borrow().clone();
        assert_eq!(count(&entries, "Starting bridge service"), 1);
        assert_eq!(count(&entries, "Stopping bridge service"), 1);
    }

    #[tokio::test]
    async fn test_missing_service_is_not_ready() {
        let bridge = BridgeOrchestrator::new();
        let peripheral = FakeEndpoint::new("peripheral");
        peripheral.state.send_replace(ServiceState::Running);
        bridge.set_peripheral(Some(peripheral.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*bridge.service_state().borrow(), ServiceState::Stopped);

        let (mqtt, _link) = mqtt();
        mqtt.start_service();
        bridge.set_mqtt(Some(mqtt.clone()));
        timeout(WAIT, bridge.service_state().wait_for(|s| s.is_running()))
            .await
            .unwrap()
            .unwrap();

        bridge.set_mqtt(None);
        timeout(WAIT, bridge.service_state().wait_for(|s| !s.is_running()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_forwards_both_directions() {
        let bridge = BridgeOrchestrator::new();
        let (mqtt, link) = mqtt();
        let central = FakeEndpoint::new("central");
        bridge.set_mqtt(Some(mqtt.clone()));
        bridge.set_central(Some(central.clone()));
        wait_for_log(&bridge, "Started central relay", 1).await;
        wait_connected(&mqtt).await;

        central.incoming.send(vec![0x01, 0x02]).unwrap();
        wait_for_log(&bridge, "Received 2 bytes from BLE devices", 1).await;
        timeout(WAIT, async {
            while link.published().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(link.published()[0].2, vec![0x01, 0x02]);

        link.deliver("relay/down", &[0x0A]);
        wait_for_log(&bridge, "Received 1 bytes from broker", 1).await;
        assert_eq!(central.sent(), vec![vec![0x0A]]);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_relay_alive() {
        let bridge = BridgeOrchestrator::new();
        let (mqtt, link) = mqtt();
        let peripheral = FakeEndpoint::new("peripheral");
        bridge.set_mqtt(Some(mqtt.clone()));
        bridge.set_peripheral(Some(peripheral.clone()));
        wait_for_log(&bridge, "Started peripheral relay", 1).await;

        // Broker not connected yet, so the first publish fails.
        peripheral.incoming.send(vec![0x01]).unwrap();
        wait_for_log(&bridge, "Failed to publish 1 bytes: Not connected to broker", 1).await;

        wait_connected(&mqtt).await;
        peripheral.incoming.send(vec![0x02]).unwrap();
        wait_for_log(&bridge, "Received 1 bytes from BLE devices", 2).await;
        timeout(WAIT, async {
            while link.published().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(link.published()[0].2, vec![0x02]);
    }

    #[tokio::test]
    async fn test_replaced_endpoint_gets_a_single_relay() {
        let bridge = BridgeOrchestrator::new();
        let (mqtt, link) = mqtt();
        let first = FakeEndpoint::new("peripheral");
        let second = FakeEndpoint::new("peripheral");
        bridge.set_mqtt(Some(mqtt.clone()));
        bridge.set_peripheral(Some(first.clone()));
        wait_for_log(&bridge, "Started peripheral relay", 1).await;

        // Rebinding the same instance is not a new candidate.
        bridge.set_peripheral(Some(first.clone()));
        bridge.set_peripheral(Some(second.clone()));
        wait_for_log(&bridge, "Started peripheral relay", 2).await;

        link.deliver("relay/down", &[0x07]);
        wait_for_log(&bridge, "Received 1 bytes from broker", 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(second.sent(), vec![vec![0x07]]);
        assert!(first.sent().is_empty());
        let entries = bridge.log().subscribe().borrow().clone();
        assert_eq!(count(&entries, "Started peripheral relay"), 2);
        assert_eq!(count(&entries, "Stopped peripheral relay"), 1);
        assert_eq!(count(&entries, "Received 1 bytes from broker"), 1);
    }

    #[tokio::test]
    async fn test_broker_connection_is_logged() {
        let bridge = BridgeOrchestrator::new();
        let (mqtt, link) = mqtt();
        bridge.set_mqtt(Some(mqtt.clone()));
        wait_for_log(&bridge, "Not connected to broker", 1).await;

        wait_connected(&mqtt).await;
        wait_for_log(&bridge, "Connected to broker", 1).await;

        link.drop_connection();
        wait_for_log(&bridge, "Not connected to broker", 2).await;
    }
}
