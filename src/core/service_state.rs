//! Lifecycle state shared by the role engines, the MQTT service and the bridge.

use serde::Serialize;
use std::fmt;

/// Whether a long-lived service is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ServiceState {
    Running,
    #[default]
    Stopped,
}

impl ServiceState {
    pub fn is_running(self) -> bool {
        self == ServiceState::Running
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Running => write!(f, "Running"),
            ServiceState::Stopped => write!(f, "Stopped"),
        }
    }
}
