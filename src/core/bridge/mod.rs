pub mod event_log;
pub mod orchestrator;

use tokio::sync::{broadcast, watch};

use crate::core::service_state::ServiceState;

pub use event_log::{BridgeLog, BridgeLogEntry, LogSeverity, BRIDGE_LOG_CAPACITY};
pub use orchestrator::BridgeOrchestrator;

/// BLE side of the bridge, implemented by both role engines.
pub trait BleEndpoint: Send + Sync {
    /// Role name used in bridge log messages.
    fn name(&self) -> &'static str;

    fn service_state(&self) -> watch::Receiver<ServiceState>;

    /// Payloads received from BLE peers.
    fn incoming_data(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Forwards `data` to every connected peer. Never blocks on the peers.
    fn send_to_connected_devices(&self, data: Vec<u8>);
}
