//! MQTT service
//! Owns the broker connection state machine. Connecting reads the current
//! settings, arms the configured timeout and subscribes to every topic filter
//! once the broker accepts. Publishing fans out to every publish topic.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::mqtt_config::MqttConfig;
use crate::core::bluetooth::constants::INBOUND_CHANNEL_CAPACITY;
use crate::core::mqtt::transport::{BrokerEvent, BrokerLink, MqttConnectionState, MqttError, MqttTransport};
use crate::core::service_state::ServiceState;

#[derive(Debug)]
enum MqttCommand {
    StartService,
    StopService,
    Connect,
    Disconnect,
}

/// Handle to the MQTT worker.
pub struct MqttService {
    commands: mpsc::UnboundedSender<MqttCommand>,
    link: Arc<dyn BrokerLink>,
    config: watch::Receiver<MqttConfig>,
    service_state: watch::Receiver<ServiceState>,
    connection_state: watch::Receiver<MqttConnectionState>,
    incoming: broadcast::Sender<Vec<u8>>,
    cancel_token: CancellationToken,
}

impl MqttService {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        events: mpsc::UnboundedReceiver<BrokerEvent>,
        config: watch::Receiver<MqttConfig>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (service_state_tx, service_state) = watch::channel(ServiceState::Stopped);
        let (connection_state_tx, connection_state) = watch::channel(MqttConnectionState::Disconnected);
        let (incoming, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        let worker = MqttWorker {
            link: link.clone(),
            config: config.clone(),
            service_state: service_state_tx,
            connection_state: connection_state_tx,
            incoming: incoming.clone(),
            deadline: None,
        };
        tokio::spawn(worker.run(command_rx, events, cancel_token.clone()));

        Self {
            commands,
            link,
            config,
            service_state,
            connection_state,
            incoming,
            cancel_token,
        }
    }

    fn send(&self, command: MqttCommand) {
        if let Err(e) = self.commands.send(command) {
            error!("MQTT worker is gone, dropping {:?}", e.0);
        }
    }

    pub fn start_service(&self) {
        self.send(MqttCommand::StartService);
    }

    /// Disconnects from the broker and stops.
    pub fn stop_service(&self) {
        self.send(MqttCommand::StopService);
    }

    pub fn connect_to_broker(&self) {
        self.send(MqttCommand::Connect);
    }

    pub fn disconnect_from_broker(&self) {
        self.send(MqttCommand::Disconnect);
    }
}

impl Drop for MqttService {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl MqttTransport for MqttService {
    fn service_state(&self) -> watch::Receiver<ServiceState> {
        self.service_state.clone()
    }

    fn connection_state(&self) -> watch::Receiver<MqttConnectionState> {
        self.connection_state.clone()
    }

    fn incoming_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.incoming.subscribe()
    }

    async fn send_to_broker(&self, data: &[u8]) -> Result<(), MqttError> {
        if !self.connection_state.borrow().is_connected() {
            return Err(MqttError::NotConnected);
        }
        let topics = self.config.borrow().publish_topics.clone();

        let mut first_error = None;
        for topic in &topics {
            if let Err(e) = self.link.publish(&topic.topic, topic.qos_level(), data).await {
                error!("Failed to publish {} bytes to {}: {}", data.len(), topic.topic, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct MqttWorker {
    link: Arc<dyn BrokerLink>,
    config: watch::Receiver<MqttConfig>,
    service_state: watch::Sender<ServiceState>,
    connection_state: watch::Sender<MqttConnectionState>,
    incoming: broadcast::Sender<Vec<u8>>,
    /// When a pending connection attempt times out.
    deadline: Option<Instant>,
}

impl MqttWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<MqttCommand>,
        mut events: mpsc::UnboundedReceiver<BrokerEvent>,
        cancel_token: CancellationToken,
    ) {
        debug!("MQTT worker started");
        loop {
            let deadline = self.deadline;
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timeout().await
                }
                else => break,
            }
        }
        if let Err(e) = self.link.disconnect().await {
            debug!("Disconnect on shutdown failed: {}", e);
        }
        debug!("MQTT worker stopped");
    }

    async fn handle_command(&mut self, command: MqttCommand) {
        match command {
            MqttCommand::StartService => {
                if self.service_state.send_replace(ServiceState::Running) != ServiceState::Running {
                    info!("MQTT service started");
                }
            }
            MqttCommand::StopService => {
                if self.service_state.borrow().is_running() {
                    self.disconnect().await;
                    self.service_state.send_replace(ServiceState::Stopped);
                    info!("MQTT service stopped");
                }
            }
            MqttCommand::Connect => self.connect().await,
            MqttCommand::Disconnect => self.disconnect().await,
        }
    }

    async fn connect(&mut self) {
        if matches!(
            *self.connection_state.borrow(),
            MqttConnectionState::Connecting | MqttConnectionState::Connected
        ) {
            debug!("Broker connection already in progress");
            return;
        }

        let config = self.config.borrow().clone();
        info!("Connecting to broker {}:{}", config.broker_address, config.broker_port);
        self.connection_state.send_replace(MqttConnectionState::Connecting);

        match self.link.connect(&config).await {
            Ok(()) => {
                // A zero timeout waits for the broker indefinitely.
                self.deadline = match config.connection_timeout_secs {
                    0 => None,
                    _ => Some(Instant::now() + config.connection_timeout()),
                };
            }
            Err(e) => {
                error!("Failed to connect to broker: {}", e);
                self.connection_state
                    .send_replace(MqttConnectionState::ConnectionError(e.to_string()));
            }
        }
    }

    async fn disconnect(&mut self) {
        self.deadline = None;
        if let Err(e) = self.link.disconnect().await {
            warn!("Failed to disconnect from broker: {}", e);
        }
        if self.connection_state.send_replace(MqttConnectionState::Disconnected) != MqttConnectionState::Disconnected {
            info!("Disconnected from broker");
        }
    }

    async fn on_timeout(&mut self) {
        self.deadline = None;
        warn!("Broker did not accept the connection in time");
        if let Err(e) = self.link.disconnect().await {
            debug!("Tearing down timed out connection failed: {}", e);
        }
        self.connection_state.send_replace(MqttConnectionState::ConnectionTimeout);
    }

    async fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                if *self.connection_state.borrow() != MqttConnectionState::Connecting {
                    debug!("Ignoring late broker confirmation");
                    return;
                }
                self.deadline = None;
                info!("Connected to broker");
                self.connection_state.send_replace(MqttConnectionState::Connected);
                self.subscribe_all().await;
            }
            BrokerEvent::ConnectFailed(reason) => {
                if *self.connection_state.borrow() != MqttConnectionState::Connecting {
                    return;
                }
                self.deadline = None;
                error!("Broker refused the connection: {}", reason);
                self.connection_state
                    .send_replace(MqttConnectionState::ConnectionError(reason));
            }
            BrokerEvent::ConnectionLost(reason) => {
                if self.connection_state.borrow().is_connected() {
                    warn!("Lost connection to broker: {}", reason);
                    self.connection_state.send_replace(MqttConnectionState::Disconnected);
                }
            }
            BrokerEvent::Message { topic, payload } => {
                debug!("Received {} bytes on {}", payload.len(), topic);
                let _ = self.incoming.send(payload);
            }
        }
    }

    async fn subscribe_all(&self) {
        let filters = self.config.borrow().topic_filters.clone();
        for filter in &filters {
            match self.link.subscribe(&filter.topic, filter.qos_level()).await {
                Ok(()) => info!("Subscribed to {} (QoS {})", filter.topic, filter.qos_level().level()),
                Err(e) => error!("Failed to subscribe to {}: {}", filter.topic, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::mqtt_config::{PublishTopic, QosLevel, TopicFilter};
    use crate::core::mqtt::simulated::SimulatedBrokerLink;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> MqttConfig {
        MqttConfig {
            topic_filters: vec![TopicFilter { topic: "relay/down".to_string(), qos: 7 }],
            publish_topics: vec![
                PublishTopic { topic: "relay/up".to_string(), qos: 1 },
                PublishTopic { topic: "relay/audit".to_string(), qos: 2 },
            ],
            ..MqttConfig::default()
        }
    }

    fn service(config: MqttConfig) -> (MqttService, Arc<SimulatedBrokerLink>, watch::Sender<MqttConfig>) {
        let (link, events) = SimulatedBrokerLink::new();
        let (config_tx, config_rx) = watch::channel(config);
        (MqttService::new(link.clone(), events, config_rx), link, config_tx)
    }

    async fn wait_state(service: &MqttService, expected: MqttConnectionState) {
        timeout(WAIT, service.connection_state().wait_for(|s| *s == expected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_subscribes_with_degraded_qos() {
        let (service, link, _config) = service(config());
        service.connect_to_broker();
        wait_state(&service, MqttConnectionState::Connected).await;

        assert_eq!(link.subscriptions(), vec![("relay/down".to_string(), QosLevel::AtMostOnce)]);
    }

    #[tokio::test]
    async fn test_send_publishes_to_every_topic() {
        let (service, link, _config) = service(config());
        service.connect_to_broker();
        wait_state(&service, MqttConnectionState::Connected).await;

        service.send_to_broker(&[0x01, 0x02]).await.unwrap();

        assert_eq!(
            link.published(),
            vec![
                ("relay/up".to_string(), QosLevel::AtLeastOnce, vec![0x01, 0x02]),
                ("relay/audit".to_string(), QosLevel::ExactlyOnce, vec![0x01, 0x02]),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_reads_current_topics() {
        let (service, link, config) = service(config());
        service.connect_to_broker();
        wait_state(&service, MqttConnectionState::Connected).await;

        config.send_modify(|c| c.publish_topics.truncate(1));
        service.send_to_broker(&[0x03]).await.unwrap();

        assert_eq!(link.published().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_topic_does_not_block_others() {
        let (service, link, _config) = service(config());
        link.fail_publish_to("relay/up");
        service.connect_to_broker();
        wait_state(&service, MqttConnectionState::Connected).await;

        let result = service.send_to_broker(&[0x09]).await;

        assert!(matches!(result, Err(MqttError::Client(_))));
        let topics: Vec<String> = link.published().into_iter().map(|(t, _, _)| t).collect();
        assert_eq!(topics, vec!["relay/audit".to_string()]);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (service, link, _config) = service(config());
        assert_eq!(service.send_to_broker(&[0x01]).await, Err(MqttError::NotConnected));
        assert!(link.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_connect_times_out() {
        let (service, link, _config) = service(config());
        link.hold_connections();
        service.connect_to_broker();
        wait_state(&service, MqttConnectionState::Connecting).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        wait_state(&service, MqttConnectionState::ConnectionTimeout).await;
        assert!(!link.is_connected());

        // A confirmation after the deadline is ignored.
        link.confirm_connection();
        tokio::task::yield_now().await;
        assert_eq!(*service.connection_state().borrow(), MqttConnectionState::ConnectionTimeout);
    }

    #[tokio::test]
    async fn test_refused_connect_is_an_error_state() {
        let (service, link, _config) = service(config());
        link.refuse_connections("not authorized");
        service.connect_to_broker();
        wait_state(&service, MqttConnectionState::ConnectionError("not authorized".to_string())).await;
    }

    #[tokio::test]
    async fn test_messages_are_broadcast() {
        let (service, link, _config) = service(config());
        let mut incoming = service.incoming_data();
        service.connect_to_broker();
        wait_state(&service, MqttConnectionState::Connected).await;

        link.deliver("relay/down", &[0xAB]);
        assert_eq!(timeout(WAIT, incoming.recv()).await.unwrap().unwrap(), vec![0xAB]);
    }

    #[tokio::test]
    async fn test_stop_service_disconnects() {
        let (service, link, _config) = service(config());
        service.start_service();
        service.connect_to_broker();
        wait_state(&service, MqttConnectionState::Connected).await;

        service.stop_service();
        timeout(WAIT, service.service_state().wait_for(|s| !s.is_running()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*service.connection_state().borrow(), MqttConnectionState::Disconnected);
        assert!(!link.is_connected());
    }
}
