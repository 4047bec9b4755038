use std::path::Path;
use std::sync::{LazyLock, Mutex, MutexGuard};

use anyhow::Result;
use log::{error, info};
use regex::Regex;
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !fs::try_exists(path).await.unwrap_or(false) {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

static MAC_ADDRESS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok());

/// Uppercase MAC address embedded in a platform device identifier, if any.
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    MAC_ADDRESS
        .as_ref()?
        .find_iter(device_id)
        .last()
        .map(|m| m.as_str().replace('-', ":").to_uppercase())
}

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_mac_address_from_platform_ids() {
        assert_eq!(
            extract_mac_address("/org/bluez/hci0/dev_aa:bb:cc:dd:ee:ff").as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(
            extract_mac_address(r"BluetoothLE#BluetoothLE00:1a:7d:da:71:13-c4-35-12-ab-cd-ef").as_deref(),
            Some("C4:35:12:AB:CD:EF")
        );
        assert_eq!(extract_mac_address("5C0B2D11-8A7E-4E4B-9E5E-0C4E5F3A1B2C"), None);
    }

    #[tokio::test]
    async fn test_ensure_directory_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_directory_exists(&nested).await.unwrap();
        ensure_directory_exists(&nested).await.unwrap();
        assert!(nested.is_dir());
    }
}
