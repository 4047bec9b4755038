//! Error types for the Bluetooth layer

use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a hardware link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("Device {0} is unknown to the link")]
    UnknownDevice(String),
    #[error("Characteristic {0} is unknown to the link")]
    UnknownCharacteristic(Uuid),
    #[error("Operation failed: {0}")]
    Operation(String),
    #[error("Not supported on this platform: {0}")]
    Unsupported(String),
}

impl From<bluest::Error> for BleError {
    fn from(e: bluest::Error) -> Self {
        BleError::Operation(e.to_string())
    }
}

/// Failures of a GATT level operation requested from an engine.
///
/// Engines never return these to callers; the most recent one is published on
/// the engine's `last_failure` field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("Device {0} is not connected")]
    NotConnected(String),
    #[error("Service {service} not found on {address}")]
    ServiceNotFound { address: String, service: Uuid },
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },
    #[error("Characteristic {0} has no CCCD")]
    MissingCccd(Uuid),
    #[error("Characteristic {0} supports neither notify nor indicate")]
    NotNotifiable(Uuid),
    #[error("Characteristic {0} does not support write without response")]
    NotWritableWithoutResponse(Uuid),
    #[error("GATT server is not open")]
    ServerNotOpen,
    #[error(transparent)]
    Transport(#[from] BleError),
}
