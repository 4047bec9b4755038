//! Bluetooth LE roles of the relay
//! The central and peripheral engines own their device registries and talk
//! to the radio through the `CentralLink` / `PeripheralLink` seams. Hardware
//! links are backed by bluest (central) and BlueZ (peripheral, Linux only);
//! simulated links back the tests and the demo mode.

pub mod central;
mod connection;
pub mod constants;
pub mod error;
#[cfg(target_os = "linux")]
mod gatt_server;
pub mod link;
pub mod notification;
pub mod peripheral;
pub mod registry;
mod scanner;
pub mod simulated;
pub mod types;

pub use central::CentralEngine;
pub use connection::BluestCentralLink;
pub use error::{BleError, GattError};
#[cfg(target_os = "linux")]
pub use gatt_server::BluezPeripheralLink;
pub use link::{CentralEvent, CentralLink, PeripheralEvent, PeripheralLink};
pub use peripheral::PeripheralEngine;
pub use registry::{DeviceRegistry, RegistrySnapshot};
pub use simulated::{SimulatedCentralLink, SimulatedPeripheralLink};
pub use types::*;
