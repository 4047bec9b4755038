//! Core of the relay: the two BLE role engines, the MQTT service and the
//! bridge that wires them together.

pub mod bluetooth;
pub mod bridge;
pub mod mqtt;
pub mod service_state;

pub use bridge::BridgeOrchestrator;
pub use service_state::ServiceState;
