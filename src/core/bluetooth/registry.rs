//! Device registry shared by the role engines
//! The registry holds one `PeerDevice` per address. Every mutation clones the
//! current snapshot, applies the change and swaps the new snapshot in, so
//! readers always observe a complete, consistent collection.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::core::bluetooth::types::PeerDevice;

/// Immutable view of every device known to an engine, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    devices: Vec<PeerDevice>,
}

impl RegistrySnapshot {
    pub fn get(&self, address: &str) -> Option<&PeerDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn devices(&self) -> &[PeerDevice] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices that are known but not connected.
    pub fn scanned(&self) -> Vec<PeerDevice> {
        self.devices.iter().filter(|d| !d.is_connected()).cloned().collect()
    }

    /// Devices with a live connection.
    pub fn connected(&self) -> Vec<PeerDevice> {
        self.devices.iter().filter(|d| d.is_connected()).cloned().collect()
    }

    fn get_mut(&mut self, address: &str) -> Option<&mut PeerDevice> {
        self.devices.iter_mut().find(|d| d.address == address)
    }
}

/// Copy-on-write device registry owned by a single engine.
#[derive(Debug)]
pub struct DeviceRegistry {
    snapshot: watch::Sender<Arc<RegistrySnapshot>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(RegistrySnapshot::default()));
        Self { snapshot }
    }

    /// Receiver that always yields the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn get(&self, address: &str) -> Option<PeerDevice> {
        self.snapshot.borrow().get(address).cloned()
    }

    /// Adds `device` unless its address is already known. Returns true if added.
    pub fn insert_if_absent(&self, device: PeerDevice) -> bool {
        self.replace_with(|snapshot| {
            if snapshot.get(&device.address).is_some() {
                return false;
            }
            snapshot.devices.push(device);
            true
        })
    }

    /// Inserts `device`, replacing an existing entry with the same address.
    pub fn upsert(&self, device: PeerDevice) {
        self.replace_with(|snapshot| {
            match snapshot.get_mut(&device.address) {
                Some(existing) => *existing = device,
                None => snapshot.devices.push(device),
            }
            true
        });
    }

    /// Applies `f` to the device with `address`. Returns false if it is unknown.
    pub fn update<F>(&self, address: &str, f: F) -> bool
    where
        F: FnOnce(&mut PeerDevice),
    {
        self.replace_with(|snapshot| match snapshot.get_mut(address) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        })
    }

    /// Keeps only the devices for which `keep` returns true.
    pub fn retain<F>(&self, keep: F)
    where
        F: Fn(&PeerDevice) -> bool,
    {
        self.replace_with(|snapshot| {
            let before = snapshot.devices.len();
            snapshot.devices.retain(|d| keep(d));
            before != snapshot.devices.len()
        });
    }

    pub fn remove(&self, address: &str) -> Option<PeerDevice> {
        let mut removed = None;
        self.replace_with(|snapshot| {
            let index = snapshot.devices.iter().position(|d| d.address == address);
            removed = index.map(|i| snapshot.devices.remove(i));
            removed.is_some()
        });
        removed
    }

    pub fn clear(&self) {
        self.retain(|_| false);
    }

    /// Builds the next snapshot from a copy of the current one and publishes it
    /// only when `f` reports a change.
    fn replace_with<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut RegistrySnapshot) -> bool,
    {
        let mut next = RegistrySnapshot::clone(&self.snapshot.borrow());
        let changed = f(&mut next);
        if changed {
            self.snapshot.send_replace(Arc::new(next));
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::ConnectionPhase;

    #[test]
    fn test_rediscovery_never_duplicates_an_address() {
        let registry = DeviceRegistry::new();
        let sightings = ["AA:BB:CC:DD:EE:FF", "11:22:33:44:55:66", "AA:BB:CC:DD:EE:FF", "AA:BB:CC:DD:EE:FF"];

        let added: Vec<bool> = sightings
            .iter()
            .map(|address| registry.insert_if_absent(PeerDevice::new(*address, "dev")))
            .collect();

        assert_eq!(added, vec![true, true, false, false]);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.devices()[0].address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(snapshot.devices()[1].address, "11:22:33:44:55:66");
    }

    #[test]
    fn test_partitions_follow_connection_phase() {
        let registry = DeviceRegistry::new();
        registry.insert_if_absent(PeerDevice::new("A", "a"));
        registry.insert_if_absent(PeerDevice::new("B", "b"));
        registry.update("B", |d| d.phase = ConnectionPhase::ServicesDiscovered);

        let snapshot = registry.snapshot();
        let scanned: Vec<String> = snapshot.scanned().into_iter().map(|d| d.address).collect();
        let connected: Vec<String> = snapshot.connected().into_iter().map(|d| d.address).collect();
        assert_eq!(scanned, vec!["A"]);
        assert_eq!(connected, vec!["B"]);
    }

    #[test]
    fn test_readers_keep_their_snapshot_across_writes() {
        let registry = DeviceRegistry::new();
        registry.insert_if_absent(PeerDevice::new("A", "a"));
        let before = registry.snapshot();

        registry.update("A", |d| d.name = "renamed".to_string());

        assert_eq!(before.get("A").map(|d| d.name.as_str()), Some("a"));
        assert_eq!(registry.get("A").map(|d| d.name), Some("renamed".to_string()));
    }

    #[test]
    fn test_unchanged_mutations_do_not_notify() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        rx.borrow_and_update();

        assert!(!registry.update("missing", |d| d.name.clear()));
        assert!(registry.remove("missing").is_none());
        assert!(!rx.has_changed().unwrap_or(true));

        registry.upsert(PeerDevice::new("A", "a"));
        assert!(rx.has_changed().unwrap_or(false));
    }
}
