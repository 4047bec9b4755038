use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use clap::ValueEnum;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::constants::MAX_ADVERTISE_TIMEOUT_MS;
use crate::utils::ensure_directory_exists;

const CONFIG_FILE_NAME: &str = "ble_config.json";

/// Which side of a BLE link this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BleRole {
    Central,
    #[default]
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseTxPower {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

impl AdvertiseTxPower {
    /// Nominal transmit power in dBm.
    pub fn dbm(self) -> i16 {
        match self {
            AdvertiseTxPower::UltraLow => -21,
            AdvertiseTxPower::Low => -15,
            AdvertiseTxPower::Medium => -7,
            AdvertiseTxPower::High => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

impl AdvertiseMode {
    /// Advertising interval the mode stands for.
    pub fn interval(self) -> Duration {
        match self {
            AdvertiseMode::LowPower => Duration::from_millis(1000),
            AdvertiseMode::Balanced => Duration::from_millis(250),
            AdvertiseMode::LowLatency => Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertiseSetting {
    pub connectable: bool,
    pub include_device_name: bool,
    pub tx_power: AdvertiseTxPower,
    /// Advertising duration in milliseconds, 0 advertises until stopped.
    pub timeout_millis: u32,
    pub mode: AdvertiseMode,
}

impl Default for AdvertiseSetting {
    fn default() -> Self {
        AdvertiseSetting {
            connectable: true,
            include_device_name: false,
            tx_power: AdvertiseTxPower::Medium,
            timeout_millis: 0,
            mode: AdvertiseMode::Balanced,
        }
    }
}

impl AdvertiseSetting {
    /// Advertising duration, `None` when unbounded. Values above the platform
    /// limit are clamped to it.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_millis {
            0 => None,
            ms => Some(Duration::from_millis(u64::from(ms.min(MAX_ADVERTISE_TIMEOUT_MS)))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub role: BleRole,
    pub advertise_setting: AdvertiseSetting,
}

impl BleConfig {
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

        info!("BLE config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the config to `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;

        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize BLE config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;

        info!("BLE config saved to {:?}.", file_path.to_string_lossy());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_fields_take_defaults_and_unknown_fields_are_ignored() {
        let json = r#"{ "role": "central", "advertise_setting": { "mode": "low_latency" }, "legacy": 1 }"#;
        let config: BleConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.role, BleRole::Central);
        assert_eq!(config.advertise_setting.mode, AdvertiseMode::LowLatency);
        assert!(config.advertise_setting.connectable);
        assert_eq!(config.advertise_setting.tx_power, AdvertiseTxPower::Medium);
    }

    #[test]
    fn test_timeout_is_unbounded_at_zero_and_clamped_above_limit() {
        let mut setting = AdvertiseSetting::default();
        assert_eq!(setting.timeout(), None);

        setting.timeout_millis = 30_000;
        assert_eq!(setting.timeout(), Some(Duration::from_secs(30)));

        setting.timeout_millis = u32::MAX;
        assert_eq!(setting.timeout(), Some(Duration::from_millis(180_000)));
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = BleConfig {
            role: BleRole::Central,
            advertise_setting: AdvertiseSetting {
                connectable: false,
                include_device_name: true,
                tx_power: AdvertiseTxPower::High,
                timeout_millis: 12_000,
                mode: AdvertiseMode::LowPower,
            },
        };

        config.save_config(dir.path()).await.unwrap();
        let loaded = BleConfig::load_config(dir.path()).await.unwrap();

        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = BleConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(loaded, BleConfig::default());
    }
}
