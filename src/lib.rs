//! BLE to MQTT relay library
//! Relays byte payloads between a Bluetooth LE role (central or peripheral)
//! and an MQTT broker.

pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
