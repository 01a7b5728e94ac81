//! Updater configuration with JSON persistence.
//!
//! This module provides:
//! - `SuotaConfig`, every option the updater recognizes
//! - `ConfigManager`, which loads and saves it as JSON
//!
//! A config is built once per session and shared read-only (`Arc<SuotaConfig>`)
//! by every component. Missing JSON fields fall back to their defaults, so
//! older files keep loading when options are added.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::suota::config::{
    DeviceInfoField, ImageBank, MemoryType, DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE,
    DEFAULT_CS_GPIO, DEFAULT_GATT_OPERATION_TIMEOUT_MS, DEFAULT_I2C_DEVICE_ADDRESS,
    DEFAULT_MISO_GPIO, DEFAULT_MOSI_GPIO, DEFAULT_SCK_GPIO, DEFAULT_SCL_GPIO, DEFAULT_SDA_GPIO,
    DEFAULT_UPLOAD_TIMEOUT_MS,
};
use crate::suota::error::SuotaResult;

/// SPI pin assignment of the external flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpiPins {
    pub miso: u8,
    pub mosi: u8,
    pub cs: u8,
    pub sck: u8,
}

impl Default for SpiPins {
    fn default() -> Self {
        Self {
            miso: DEFAULT_MISO_GPIO,
            mosi: DEFAULT_MOSI_GPIO,
            cs: DEFAULT_CS_GPIO,
            sck: DEFAULT_SCK_GPIO,
        }
    }
}

/// I2C bus settings of the external EEPROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct I2cPins {
    pub device_address: u16,
    pub scl: u8,
    pub sda: u8,
}

impl Default for I2cPins {
    fn default() -> Self {
        Self {
            device_address: DEFAULT_I2C_DEVICE_ADDRESS,
            scl: DEFAULT_SCL_GPIO,
            sda: DEFAULT_SDA_GPIO,
        }
    }
}

/// Every recognized updater option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuotaConfig {
    /// Host may show prompts (e.g. reboot confirmation).
    pub allow_dialog_display: bool,
    /// Reject images whose header checksum does not match.
    pub check_header_crc: bool,
    /// Track throughput and emit speed events.
    pub calculate_statistics: bool,
    /// Whole-upload budget in milliseconds.
    pub upload_timeout_ms: u64,
    /// Budget of a single GATT operation in milliseconds.
    pub gatt_operation_timeout_ms: u64,

    /// Send the reboot sentinel right after a successful upload.
    pub auto_reboot: bool,
    /// Drop the link when the caller declines the reboot.
    pub auto_disconnect_if_reboot_denied: bool,

    /// Read Device Information during setup.
    pub auto_read_device_info: bool,
    /// Queue Device Information reads before the SUOTA capability reads.
    pub read_device_info_first: bool,
    /// Read every Device Information characteristic instead of `device_info_to_read`.
    pub read_all_device_info: bool,
    /// Fields read when `read_all_device_info` is off.
    pub device_info_to_read: Vec<DeviceInfoField>,

    // Per-event notification toggles
    pub notify_device_info_read: bool,
    pub notify_device_info_read_completed: bool,
    pub notify_suota_log: bool,
    pub notify_suota_log_chunk: bool,
    pub notify_suota_log_block: bool,
    pub notify_chunk_send: bool,
    pub notify_block_sent: bool,
    pub notify_upload_progress: bool,

    /// Requested block size; the manager may shrink it to fit the link.
    pub default_block_size: usize,
    /// Requested chunk size; capped by the negotiated MTU.
    pub default_chunk_size: usize,
    pub default_image_bank: ImageBank,
    pub default_memory_type: MemoryType,
    pub spi: SpiPins,
    pub i2c: I2cPins,
}

impl Default for SuotaConfig {
    fn default() -> Self {
        Self {
            allow_dialog_display: true,
            check_header_crc: true,
            calculate_statistics: true,
            upload_timeout_ms: DEFAULT_UPLOAD_TIMEOUT_MS,
            gatt_operation_timeout_ms: DEFAULT_GATT_OPERATION_TIMEOUT_MS,
            auto_reboot: true,
            auto_disconnect_if_reboot_denied: false,
            auto_read_device_info: true,
            read_device_info_first: true,
            read_all_device_info: false,
            device_info_to_read: vec![
                DeviceInfoField::Manufacturer,
                DeviceInfoField::ModelNumber,
                DeviceInfoField::FirmwareRevision,
                DeviceInfoField::SoftwareRevision,
            ],
            notify_device_info_read: true,
            notify_device_info_read_completed: true,
            notify_suota_log: true,
            notify_suota_log_chunk: false,
            notify_suota_log_block: false,
            notify_chunk_send: true,
            notify_block_sent: true,
            notify_upload_progress: true,
            default_block_size: DEFAULT_BLOCK_SIZE,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            default_image_bank: ImageBank::Oldest,
            default_memory_type: MemoryType::Spi,
            spi: SpiPins::default(),
            i2c: I2cPins::default(),
        }
    }
}

impl SuotaConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn gatt_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.gatt_operation_timeout_ms)
    }

    /// Device Information fields to read during setup.
    pub fn device_info_fields(&self) -> Vec<DeviceInfoField> {
        if self.read_all_device_info {
            DeviceInfoField::ALL.to_vec()
        } else {
            self.device_info_to_read.clone()
        }
    }

    /// Check if this config differs from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Config file name inside the config directory.
const CONFIG_FILENAME: &str = "suota_config.json";

/// Manages persistence of the updater config to a JSON file.
pub struct ConfigManager {
    config_file_path: PathBuf,
}

impl ConfigManager {
    /// Create a manager for `suota_config.json` in the given directory.
    pub fn new(config_dir: &Path) -> Self {
        let config_file_path = config_dir.join(CONFIG_FILENAME);
        Self { config_file_path }
    }

    /// Create a manager for an explicit file path.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            config_file_path: path.into(),
        }
    }

    /// Load the config, returning defaults if the file doesn't exist or is empty.
    pub fn load(&self) -> SuotaResult<SuotaConfig> {
        if !self.config_file_path.exists() {
            return Ok(SuotaConfig::default());
        }

        let contents = fs::read_to_string(&self.config_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(SuotaConfig::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Save the config, creating the parent directory if needed.
    pub fn save(&self, config: &SuotaConfig) -> SuotaResult<()> {
        if let Some(parent) = self.config_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(config)?;
        fs::write(&self.config_file_path, contents)?;

        Ok(())
    }

    /// Get the path where the config is stored.
    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }
}
