use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::utils::ensure_directory_exists;

const CONFIG_FILE_NAME: &str = "mqtt_config.json";

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    /// Maps a numeric QoS to a level. Anything outside 0..=2 degrades to QoS 0.
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => QosLevel::AtLeastOnce,
            2 => QosLevel::ExactlyOnce,
            _ => QosLevel::AtMostOnce,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// A topic filter subscribed to on connect.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicFilter {
    pub topic: String,
    pub qos: u8,
}

/// A topic every payload coming from BLE is published to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishTopic {
    pub topic: String,
    pub qos: u8,
}

impl TopicFilter {
    pub fn qos_level(&self) -> QosLevel {
        QosLevel::from_level(self.qos)
    }
}

impl PublishTopic {
    pub fn qos_level(&self) -> QosLevel {
        QosLevel::from_level(self.qos)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_address: String,
    pub broker_port: u16,
    pub use_tls: bool,
    pub use_credentials: bool,
    pub user_name: String,
    pub password: String,
    /// Seconds to wait for the broker to accept the connection.
    pub connection_timeout_secs: u64,
    pub topic_filters: Vec<TopicFilter>,
    pub publish_topics: Vec<PublishTopic>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            broker_address: "broker.hivemq.com".to_string(),
            broker_port: 1883,
            use_tls: false,
            use_credentials: false,
            user_name: String::new(),
            password: String::new(),
            connection_timeout_secs: 5,
            topic_filters: Vec::new(),
            publish_topics: Vec::new(),
        }
    }
}

impl MqttConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Loads the config from `config_dir`, falling back to defaults when the file is absent.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("MQTT config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the config to `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;

        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize MQTT config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;

        info!("MQTT config saved to {:?}.", file_path.to_string_lossy());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_qos_degrades_to_zero() {
        assert_eq!(QosLevel::from_level(0), QosLevel::AtMostOnce);
        assert_eq!(QosLevel::from_level(1), QosLevel::AtLeastOnce);
        assert_eq!(QosLevel::from_level(2), QosLevel::ExactlyOnce);
        assert_eq!(QosLevel::from_level(3), QosLevel::AtMostOnce);
        assert_eq!(QosLevel::from_level(255), QosLevel::AtMostOnce);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{ "broker_address": "10.0.0.2", "topic_filters": [{ "topic": "relay/in" }], "unknown": true }"#;
        let config: MqttConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.broker_address, "10.0.0.2");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.connection_timeout_secs, 5);
        assert_eq!(config.topic_filters, vec![TopicFilter { topic: "relay/in".to_string(), qos: 0 }]);
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = MqttConfig {
            broker_address: "mqtt.example.org".to_string(),
            broker_port: 8883,
            use_tls: true,
            use_credentials: true,
            user_name: "relay".to_string(),
            password: "secret".to_string(),
            connection_timeout_secs: 12,
            topic_filters: vec![TopicFilter { topic: "relay/down/#".to_string(), qos: 1 }],
            publish_topics: vec![
                PublishTopic { topic: "relay/up".to_string(), qos: 2 },
                PublishTopic { topic: "relay/audit".to_string(), qos: 0 },
            ],
        };

        config.save_config(dir.path()).await.unwrap();
        let loaded = MqttConfig::load_config(dir.path()).await.unwrap();

        assert_eq!(loaded, config);
    }
}
