//! Constants used throughout the Bluetooth layer
//! This module contains the fixed relay GATT surface, standard descriptor
//! UUIDs, CCCD values and the timing values used by the hardware links.

use uuid::Uuid;

/// Primary service hosted by the peripheral role.
pub const UUID_RELAY_SERVICE: Uuid = Uuid::from_u128(0xd2dfc1a2_9f53_494b_a2a1_1efd6148aa81);

/// Characteristic the peripheral role notifies outbound payloads on.
pub const UUID_RELAY_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x007a7899_dc76_4778_b33b_3460bf250eed);

/// Characteristic remote centrals write inbound payloads to.
pub const UUID_RELAY_WRITE_CHAR: Uuid = Uuid::from_u128(0xeeb6d18b_863b_4fb5_81b6_a38902b985df);

/// Client Characteristic Configuration Descriptor
pub const UUID_CCCD: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value that enables notifications
pub const CCCD_ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];

/// CCCD value that enables indications
pub const CCCD_ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];

/// CCCD value that disables both notifications and indications
pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

/// Capacity of the inbound payload broadcast channel of each engine
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Name used for devices that do not advertise one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// Interval at which the central link checks whether a connection is still alive
pub const CONNECTION_POLL_INTERVAL_MS: u64 = 1000;

/// Upper bound of an advertising timeout in milliseconds
pub const MAX_ADVERTISE_TIMEOUT_MS: u32 = 180_000;

/// How long the GATT server waits for the engine to acknowledge a write
pub const WRITE_RESPONSE_TIMEOUT_MS: u64 = 2000;
