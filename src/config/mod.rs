//! Persisted settings
//! One JSON document per domain, exposed through watch channels so the
//! engines always read the current value when an operation is issued.

pub mod ble_config;
pub mod mqtt_config;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::info;
use tokio::sync::watch;

use crate::config::ble_config::BleConfig;
use crate::config::mqtt_config::MqttConfig;

const APP_DIR_NAME: &str = "ble-mqtt-relay";

/// Platform config directory of the application.
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| anyhow!("No config directory available on this platform"))
}

/// Observable, persisted MQTT and BLE settings.
#[derive(Debug)]
pub struct SettingsStore {
    config_dir: PathBuf,
    mqtt: watch::Sender<MqttConfig>,
    ble: watch::Sender<BleConfig>,
}

impl SettingsStore {
    /// Loads both documents from `config_dir`.
    pub async fn load(config_dir: impl Into<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.into();
        let mqtt = MqttConfig::load_config(&config_dir).await?;
        let ble = BleConfig::load_config(&config_dir).await?;
        info!("Settings loaded from {:?}", config_dir);
        Ok(Self::with_values(config_dir, mqtt, ble))
    }

    /// Creates a store from in-memory values.
    pub fn with_values(config_dir: impl Into<PathBuf>, mqtt: MqttConfig, ble: BleConfig) -> Self {
        Self {
            config_dir: config_dir.into(),
            mqtt: watch::Sender::new(mqtt),
            ble: watch::Sender::new(ble),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn mqtt_config(&self) -> watch::Receiver<MqttConfig> {
        self.mqtt.subscribe()
    }

    pub fn ble_config(&self) -> watch::Receiver<BleConfig> {
        self.ble.subscribe()
    }

    pub fn current_mqtt_config(&self) -> MqttConfig {
        self.mqtt.borrow().clone()
    }

    pub fn current_ble_config(&self) -> BleConfig {
        self.ble.borrow().clone()
    }

    /// Applies `f` to the MQTT settings, publishes and persists the result.
    pub async fn update_mqtt_config<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut MqttConfig),
    {
        self.mqtt.send_modify(f);
        let config = self.current_mqtt_config();
        config.save_config(&self.config_dir).await
    }

    /// Applies `f` to the BLE settings, publishes and persists the result.
    pub async fn update_ble_config<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BleConfig),
    {
        self.ble.send_modify(f);
        let config = self.current_ble_config();
        config.save_config(&self.config_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ble_config::BleRole;
    use crate::config::mqtt_config::PublishTopic;

    #[tokio::test]
    async fn test_update_is_observed_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path()).await.unwrap();
        let mut mqtt_rx = store.mqtt_config();
        mqtt_rx.borrow_and_update();

        store
            .update_mqtt_config(|c| {
                c.publish_topics.push(PublishTopic { topic: "relay/up".to_string(), qos: 1 })
            })
            .await
            .unwrap();
        store.update_ble_config(|c| c.role = BleRole::Central).await.unwrap();

        assert!(mqtt_rx.has_changed().unwrap());
        assert_eq!(mqtt_rx.borrow().publish_topics.len(), 1);

        let reloaded = SettingsStore::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.current_mqtt_config(), store.current_mqtt_config());
        assert_eq!(reloaded.current_ble_config().role, BleRole::Central);
    }
}
