//! Notification subscription rules
//! Decides which CCCD value enables a characteristic's value pushes. The
//! actual descriptor write lives behind `CentralLink::write_descriptor`, so
//! platform differences in how a CCCD is written stay in the link.

use serde::Serialize;

use crate::core::bluetooth::constants::{CCCD_DISABLE, CCCD_ENABLE_INDICATION, CCCD_ENABLE_NOTIFICATION};
use crate::core::bluetooth::error::GattError;
use crate::core::bluetooth::types::{Capabilities, GattCharacteristic};

/// Value written to a Client Characteristic Configuration Descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CccdValue {
    EnableNotification,
    EnableIndication,
    Disable,
}

impl CccdValue {
    pub fn bytes(self) -> [u8; 2] {
        match self {
            CccdValue::EnableNotification => CCCD_ENABLE_NOTIFICATION,
            CccdValue::EnableIndication => CCCD_ENABLE_INDICATION,
            CccdValue::Disable => CCCD_DISABLE,
        }
    }

    pub fn is_enable(self) -> bool {
        self != CccdValue::Disable
    }
}

/// Picks the enable value for `characteristic`.
///
/// NOTIFY wins when both NOTIFY and INDICATE are supported. A characteristic
/// without a CCCD cannot be subscribed to.
pub fn subscription_value(characteristic: &GattCharacteristic) -> Result<CccdValue, GattError> {
    let caps = characteristic.capabilities;
    let value = if caps.contains(Capabilities::NOTIFY) {
        CccdValue::EnableNotification
    } else if caps.contains(Capabilities::INDICATE) {
        CccdValue::EnableIndication
    } else {
        return Err(GattError::NotNotifiable(characteristic.uuid));
    };

    if characteristic.cccd().is_none() {
        return Err(GattError::MissingCccd(characteristic.uuid));
    }
    Ok(value)
}

/// Whether unsubscribing needs a descriptor write at all.
pub fn needs_disable_write(characteristic: &GattCharacteristic) -> bool {
    let caps = characteristic.capabilities;
    (caps.contains(Capabilities::NOTIFY) || caps.contains(Capabilities::INDICATE))
        && characteristic.cccd().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::UUID_CCCD;
    use uuid::Uuid;

    const SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
    const CHAR: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

    #[test]
    fn test_notify_preferred_over_indicate() {
        let chr = GattCharacteristic::new(SERVICE, CHAR, Capabilities::NOTIFY | Capabilities::INDICATE)
            .with_descriptor(UUID_CCCD);
        assert_eq!(subscription_value(&chr), Ok(CccdValue::EnableNotification));
        assert_eq!(CccdValue::EnableNotification.bytes(), [0x01, 0x00]);
    }

    #[test]
    fn test_indicate_only_uses_indication() {
        let chr = GattCharacteristic::new(SERVICE, CHAR, Capabilities::INDICATE).with_descriptor(UUID_CCCD);
        assert_eq!(subscription_value(&chr), Ok(CccdValue::EnableIndication));
    }

    #[test]
    fn test_missing_cccd_is_an_error() {
        let chr = GattCharacteristic::new(SERVICE, CHAR, Capabilities::NOTIFY);
        assert_eq!(subscription_value(&chr), Err(GattError::MissingCccd(CHAR)));
        assert!(!needs_disable_write(&chr));
    }

    #[test]
    fn test_plain_characteristic_is_not_notifiable() {
        let chr = GattCharacteristic::new(SERVICE, CHAR, Capabilities::READ).with_descriptor(UUID_CCCD);
        assert_eq!(subscription_value(&chr), Err(GattError::NotNotifiable(CHAR)));
    }
}
