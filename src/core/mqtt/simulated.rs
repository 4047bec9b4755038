//! In-memory broker link for demos and tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::config::mqtt_config::{MqttConfig, QosLevel};
use crate::core::mqtt::transport::{BrokerEvent, BrokerLink, MqttError};
use crate::utils::lock;

#[derive(Default)]
struct BrokerState {
    connected: bool,
    hold: bool,
    refuse: Option<String>,
    failing_topics: HashSet<String>,
    configs: Vec<MqttConfig>,
    subscriptions: Vec<(String, QosLevel)>,
    published: Vec<(String, QosLevel, Vec<u8>)>,
}

pub struct SimulatedBrokerLink {
    state: Mutex<BrokerState>,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl SimulatedBrokerLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            events,
        });
        (link, rx)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    /// Leaves the next connection attempts unanswered.
    pub fn hold_connections(&self) {
        self.lock().hold = true;
    }

    /// Answers a held connection attempt.
    pub fn confirm_connection(&self) {
        self.lock().connected = true;
        self.emit(BrokerEvent::Connected);
    }

    pub fn refuse_connections(&self, reason: &str) {
        self.lock().refuse = Some(reason.to_string());
    }

    pub fn fail_publish_to(&self, topic: &str) {
        self.lock().failing_topics.insert(topic.to_string());
    }

    /// Delivers a message as if it arrived on `topic`.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.emit(BrokerEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn drop_connection(&self) {
        self.lock().connected = false;
        self.emit(BrokerEvent::ConnectionLost("connection reset".to_string()));
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Settings of every connection attempt so far.
    pub fn configs(&self) -> Vec<MqttConfig> {
        self.lock().configs.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QosLevel)> {
        self.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<(String, QosLevel, Vec<u8>)> {
        self.lock().published.clone()
    }
}

#[async_trait]
impl BrokerLink for SimulatedBrokerLink {
    async fn connect(&self, config: &MqttConfig) -> Result<(), MqttError> {
        let event = {
            let mut state = self.lock();
            state.configs.push(config.clone());
            if let Some(reason) = state.refuse.clone() {
                Some(BrokerEvent::ConnectFailed(reason))
            } else if state.hold {
                None
            } else {
                state.connected = true;
                Some(BrokerEvent::Connected)
            }
        };
        debug!("Simulated broker connect to {}:{}", config.broker_address, config.broker_port);
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.lock().connected = false;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MqttError> {
        self.lock().subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QosLevel, payload: &[u8]) -> Result<(), MqttError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(MqttError::NotConnected);
        }
        if state.failing_topics.contains(topic) {
            return Err(MqttError::Client(format!("publish to {} rejected", topic)));
        }
        state.published.push((topic.to_string(), qos, payload.to_vec()));
        Ok(())
    }
}
