pub mod client;
pub mod service;
pub mod simulated;
pub mod transport;

pub use client::RumqttcLink;
pub use service::MqttService;
pub use simulated::SimulatedBrokerLink;
pub use transport::{BrokerEvent, BrokerLink, MqttConnectionState, MqttError, MqttTransport};
