//! MQTT seams
//! `MqttTransport` is what the bridge sees. `BrokerLink` is the wire client
//! underneath `MqttService`; it reports its progress as `BrokerEvent`s.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::config::mqtt_config::{MqttConfig, QosLevel};
use crate::core::service_state::ServiceState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("MQTT client error: {0}")]
    Client(String),
}

/// Connection to the broker as seen by the service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum MqttConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ConnectionError(String),
    ConnectionTimeout,
}

impl MqttConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, MqttConnectionState::Connected)
    }
}

impl fmt::Display for MqttConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttConnectionState::Disconnected => write!(f, "Disconnected"),
            MqttConnectionState::Connecting => write!(f, "Connecting"),
            MqttConnectionState::Connected => write!(f, "Connected"),
            MqttConnectionState::ConnectionError(reason) => write!(f, "Connection error: {}", reason),
            MqttConnectionState::ConnectionTimeout => write!(f, "Connection timeout"),
        }
    }
}

/// Broker side of the bridge.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    fn service_state(&self) -> watch::Receiver<ServiceState>;

    fn connection_state(&self) -> watch::Receiver<MqttConnectionState>;

    /// Payloads of every message received on a subscribed topic.
    fn incoming_data(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Publishes `data` to every configured publish topic.
    async fn send_to_broker(&self, data: &[u8]) -> Result<(), MqttError>;
}

/// Events raised by a broker link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    ConnectFailed(String),
    ConnectionLost(String),
    Message { topic: String, payload: Vec<u8> },
}

/// Wire client operations.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Starts connecting with `config`. Completion arrives as a `BrokerEvent`.
    async fn connect(&self, config: &MqttConfig) -> Result<(), MqttError>;

    async fn disconnect(&self) -> Result<(), MqttError>;

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), MqttError>;

    async fn publish(&self, topic: &str, qos: QosLevel, payload: &[u8]) -> Result<(), MqttError>;
}
