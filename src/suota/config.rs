//! Wire constants for the SUOTA protocol.
//!
//! UUIDs, status values, sentinels and error codes are fixed by the
//! device-side SUOTA service and must not be changed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// SUOTA Service
// ============================================================================

/// SUOTA primary service (16-bit 0xFEF5).
pub const SUOTA_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fef5_0000_1000_8000_00805f9b34fb);

/// Memory device characteristic: memory type + image bank.
pub const MEM_DEV_UUID: Uuid = Uuid::from_u128(0x8082caa8_41a6_4021_91c6_56f9b954cc34);

/// GPIO map characteristic: pin assignment of the external memory.
pub const GPIO_MAP_UUID: Uuid = Uuid::from_u128(0x724249f0_5ec3_4b5f_8804_42345af08651);

/// Memory info characteristic.
pub const MEM_INFO_UUID: Uuid = Uuid::from_u128(0x6c53db25_47a1_45fe_a022_7c92fb334fd4);

/// Patch length characteristic: byte length of the next block (u16), and the
/// end, reboot and abort sentinels (u32).
pub const PATCH_LEN_UUID: Uuid = Uuid::from_u128(0x9d84b9a3_000c_49d8_9183_855b673fda31);

/// Patch data characteristic: receives chunks.
pub const PATCH_DATA_UUID: Uuid = Uuid::from_u128(0x457871e8_d516_4ca1_9116_57d0b17b9cb2);

/// Service status characteristic: notifies status and error codes.
pub const SERV_STATUS_UUID: Uuid = Uuid::from_u128(0x5f78df94_798c_46f5_990a_b3eb6a065c88);

/// Client characteristic configuration descriptor.
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// SUOTA protocol version (u8).
pub const SUOTA_VERSION_UUID: Uuid = Uuid::from_u128(0x64b4e8b5_0de5_401b_a21d_acc8db3b913a);

/// Maximum patch data write size supported by the device (u16).
pub const SUOTA_PATCH_DATA_CHAR_SIZE_UUID: Uuid =
    Uuid::from_u128(0x42c3dfdd_77be_4d9c_8454_8f875267fb3b);

/// MTU the device negotiated (u16).
pub const SUOTA_MTU_UUID: Uuid = Uuid::from_u128(0xb7de1eea_823d_43bb_a3af_c4903dfce23c);

/// L2CAP channel PSM (u16).
pub const SUOTA_L2CAP_PSM_UUID: Uuid = Uuid::from_u128(0x61c8849c_f639_4765_946e_5c3419bebb2a);

/// Characteristics without which a transfer cannot run.
pub const REQUIRED_SUOTA_CHARACTERISTICS: &[Uuid] = &[
    MEM_DEV_UUID,
    GPIO_MAP_UUID,
    PATCH_LEN_UUID,
    PATCH_DATA_UUID,
    SERV_STATUS_UUID,
];

/// Capability characteristics read before a transfer may start.
pub const SUOTA_INFO_CHARACTERISTICS: &[Uuid] = &[
    SUOTA_VERSION_UUID,
    SUOTA_PATCH_DATA_CHAR_SIZE_UUID,
    SUOTA_MTU_UUID,
    SUOTA_L2CAP_PSM_UUID,
];

// ============================================================================
// Device Information Service
// ============================================================================

/// Device Information service (16-bit 0x180A).
pub const DEVICE_INFO_SERVICE_UUID: Uuid = bluetooth_uuid(0x180A);

/// Build a 128-bit UUID from a 16-bit Bluetooth SIG assigned number.
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Device Information characteristics in read order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceInfoField {
    Manufacturer,
    ModelNumber,
    SerialNumber,
    HardwareRevision,
    FirmwareRevision,
    SoftwareRevision,
    SystemId,
    Ieee11073,
    PnpId,
}

impl DeviceInfoField {
    /// Every field, in the order they are read.
    pub const ALL: [DeviceInfoField; 9] = [
        DeviceInfoField::Manufacturer,
        DeviceInfoField::ModelNumber,
        DeviceInfoField::SerialNumber,
        DeviceInfoField::HardwareRevision,
        DeviceInfoField::FirmwareRevision,
        DeviceInfoField::SoftwareRevision,
        DeviceInfoField::SystemId,
        DeviceInfoField::Ieee11073,
        DeviceInfoField::PnpId,
    ];

    pub fn uuid(&self) -> Uuid {
        bluetooth_uuid(match self {
            DeviceInfoField::Manufacturer => 0x2A29,
            DeviceInfoField::ModelNumber => 0x2A24,
            DeviceInfoField::SerialNumber => 0x2A25,
            DeviceInfoField::HardwareRevision => 0x2A27,
            DeviceInfoField::FirmwareRevision => 0x2A26,
            DeviceInfoField::SoftwareRevision => 0x2A28,
            DeviceInfoField::SystemId => 0x2A23,
            DeviceInfoField::Ieee11073 => 0x2A2A,
            DeviceInfoField::PnpId => 0x2A50,
        })
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.uuid() == uuid)
    }

    /// Whether the value is UTF-8 text rather than a binary record.
    pub fn is_text(&self) -> bool {
        !matches!(
            self,
            DeviceInfoField::SystemId | DeviceInfoField::Ieee11073 | DeviceInfoField::PnpId
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceInfoField::Manufacturer => "Manufacturer",
            DeviceInfoField::ModelNumber => "Model Number",
            DeviceInfoField::SerialNumber => "Serial Number",
            DeviceInfoField::HardwareRevision => "Hardware Revision",
            DeviceInfoField::FirmwareRevision => "Firmware Revision",
            DeviceInfoField::SoftwareRevision => "Software Revision",
            DeviceInfoField::SystemId => "System ID",
            DeviceInfoField::Ieee11073 => "IEEE 11073 Data",
            DeviceInfoField::PnpId => "PnP ID",
        }
    }
}

// ============================================================================
// Status Values and Sentinels
// ============================================================================

/// Status notification: the device accepted the last block / command.
pub const SERVICE_STATUS_OK: u8 = 0x02;

/// Status notification: the device started receiving an image.
pub const IMAGE_STARTED: u8 = 0x10;

/// Written to end the image transfer.
pub const SUOTA_END: u32 = 0xFE00_0000;

/// Written to make the device reboot into the new image.
pub const SUOTA_REBOOT: u32 = 0xFD00_0000;

/// Written to abort an ongoing transfer.
pub const SUOTA_ABORT: u32 = 0xFF00_0000;

// ============================================================================
// Link Defaults
// ============================================================================

/// ATT MTU before any exchange.
pub const DEFAULT_MTU: u16 = 23;

/// ATT write header bytes subtracted from the MTU.
pub const ATT_WRITE_OVERHEAD: u16 = 3;

/// Patch data size assumed until the device reports its own.
pub const DEFAULT_PATCH_DATA_SIZE: u16 = 20;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 240;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Largest block the 16-bit patch length can announce.
pub const MAX_BLOCK_SIZE: usize = u16::MAX as usize;

/// Default whole-upload timeout.
pub const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 30_000;

/// Default timeout of a single GATT operation.
pub const DEFAULT_GATT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Interval between speed statistics snapshots.
pub const STATISTICS_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between current speed samples.
pub const CURRENT_SPEED_INTERVAL: Duration = Duration::from_millis(1000);

// ============================================================================
// Memory Configuration
// ============================================================================

/// External memory the image is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum MemoryType {
    I2c = 0x12,
    #[default]
    Spi = 0x13,
}

impl MemoryType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x12 => Some(MemoryType::I2c),
            0x13 => Some(MemoryType::Spi),
            _ => None,
        }
    }
}

/// Target image bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum ImageBank {
    /// Let the device overwrite its oldest image.
    #[default]
    Oldest = 0,
    Bank1 = 1,
    Bank2 = 2,
}

impl ImageBank {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ImageBank::Oldest),
            1 => Some(ImageBank::Bank1),
            2 => Some(ImageBank::Bank2),
            _ => None,
        }
    }
}

/// SPI pin defaults.
pub const DEFAULT_MISO_GPIO: u8 = 0x05;
pub const DEFAULT_MOSI_GPIO: u8 = 0x06;
pub const DEFAULT_CS_GPIO: u8 = 0x03;
pub const DEFAULT_SCK_GPIO: u8 = 0x00;

/// I2C defaults.
pub const DEFAULT_I2C_DEVICE_ADDRESS: u16 = 0x50;
pub const DEFAULT_SCL_GPIO: u8 = 0x02;
pub const DEFAULT_SDA_GPIO: u8 = 0x03;

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes notified by the device on the status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceError {
    SpotaServiceStarted = 0x01,
    ServiceExit = 0x03,
    CrcMismatch = 0x04,
    PatchLengthError = 0x05,
    ExternalMemoryError = 0x06,
    InternalMemoryError = 0x07,
    InvalidMemoryType = 0x08,
    ApplicationError = 0x09,
    InvalidImageBank = 0x11,
    InvalidImageHeader = 0x12,
    InvalidImageSize = 0x13,
    InvalidProductHeader = 0x14,
    SameImageError = 0x15,
    ExternalMemoryReadError = 0x16,
}

impl DeviceError {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DeviceError::SpotaServiceStarted),
            0x03 => Some(DeviceError::ServiceExit),
            0x04 => Some(DeviceError::CrcMismatch),
            0x05 => Some(DeviceError::PatchLengthError),
            0x06 => Some(DeviceError::ExternalMemoryError),
            0x07 => Some(DeviceError::InternalMemoryError),
            0x08 => Some(DeviceError::InvalidMemoryType),
            0x09 => Some(DeviceError::ApplicationError),
            0x11 => Some(DeviceError::InvalidImageBank),
            0x12 => Some(DeviceError::InvalidImageHeader),
            0x13 => Some(DeviceError::InvalidImageSize),
            0x14 => Some(DeviceError::InvalidProductHeader),
            0x15 => Some(DeviceError::SameImageError),
            0x16 => Some(DeviceError::ExternalMemoryReadError),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DeviceError::SpotaServiceStarted => "Wrong SUOTA service started",
            DeviceError::ServiceExit => "Forced exit of SUOTA service",
            DeviceError::CrcMismatch => "Overall patch CRC mismatch",
            DeviceError::PatchLengthError => "Received patch length does not match",
            DeviceError::ExternalMemoryError => "Writing to external memory failed",
            DeviceError::InternalMemoryError => "Not enough internal memory for patch",
            DeviceError::InvalidMemoryType => "Invalid memory device",
            DeviceError::ApplicationError => "Application error",
            DeviceError::InvalidImageBank => "Invalid image bank",
            DeviceError::InvalidImageHeader => "Invalid image header",
            DeviceError::InvalidImageSize => "Invalid image size",
            DeviceError::InvalidProductHeader => "Invalid product header",
            DeviceError::SameImageError => "Same image error",
            DeviceError::ExternalMemoryReadError => "Failed to read from external memory",
        }
    }
}

/// Application-level failure codes, kept above the device range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u16)]
pub enum ApplicationError {
    SuotaNotSupported = 0xFFFF,
    ServiceDiscoveryError = 0xFFFE,
    GattOperationError = 0xFFFD,
    MtuRequestFailed = 0xFFFC,
    FirmwareLoadFailed = 0xFFFB,
    InvalidFirmwareCrc = 0xFFFA,
    UploadTimeout = 0xFFF9,
    ProtocolError = 0xFFF8,
    NotConnected = 0xFFF7,
}

impl ApplicationError {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0xFFFF => Some(ApplicationError::SuotaNotSupported),
            0xFFFE => Some(ApplicationError::ServiceDiscoveryError),
            0xFFFD => Some(ApplicationError::GattOperationError),
            0xFFFC => Some(ApplicationError::MtuRequestFailed),
            0xFFFB => Some(ApplicationError::FirmwareLoadFailed),
            0xFFFA => Some(ApplicationError::InvalidFirmwareCrc),
            0xFFF9 => Some(ApplicationError::UploadTimeout),
            0xFFF8 => Some(ApplicationError::ProtocolError),
            0xFFF7 => Some(ApplicationError::NotConnected),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ApplicationError::SuotaNotSupported => "SUOTA is not supported by the device",
            ApplicationError::ServiceDiscoveryError => "Service discovery failed",
            ApplicationError::GattOperationError => "GATT operation failed",
            ApplicationError::MtuRequestFailed => "MTU request failed",
            ApplicationError::FirmwareLoadFailed => "Failed to load the firmware file",
            ApplicationError::InvalidFirmwareCrc => "Firmware CRC validation failed",
            ApplicationError::UploadTimeout => "Upload timed out",
            ApplicationError::ProtocolError => "Unexpected protocol behavior",
            ApplicationError::NotConnected => "Device is not connected",
        }
    }
}
