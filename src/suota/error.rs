//! Error types for the SUOTA updater.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::config::{ApplicationError, DeviceError};

/// Result type alias for SUOTA operations.
pub type SuotaResult<T> = Result<T, SuotaError>;

/// Failure of a single GATT operation, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    /// The operation did not resolve within the per-operation timeout.
    #[error("GATT operation timed out")]
    Timeout,

    /// The transport refused to start the operation.
    #[error("GATT operation rejected: {0}")]
    Rejected(String),

    /// The remote device or the platform stack reported a failure.
    #[error("GATT operation failed: {0}")]
    Failed(String),

    /// The link dropped while the operation was pending.
    #[error("Link disconnected")]
    Disconnected,
}

/// Errors that can occur while loading images or driving a transfer.
#[derive(Debug, Error)]
pub enum SuotaError {
    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON error while reading or writing configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The first two bytes match no known header layout.
    #[error("Unrecognized header signature 0x{0:02X} 0x{1:02X}")]
    UnrecognizedHeaderSignature(u8, u8),

    /// The buffer ends before the layout's header does.
    #[error("Truncated header: layout needs {needed} bytes, buffer has {actual}")]
    TruncatedHeader { needed: usize, actual: usize },

    /// Header and payload do not fit in the file.
    #[error("Payload of {payload_size} bytes at offset {offset} exceeds file size {file_size}")]
    PayloadOutOfBounds {
        offset: usize,
        payload_size: usize,
        file_size: usize,
    },

    /// Recomputed payload checksum differs from the header's.
    #[error("Header checksum mismatch: expected 0x{expected:02X}, computed 0x{actual:02X}")]
    HeaderChecksumInvalid { expected: u8, actual: u8 },

    /// There is nothing to upload.
    #[error("Firmware image is empty")]
    EmptyFirmware,

    /// A firmware package holds no image entry.
    #[error("No firmware image found in package '{package}'")]
    MissingFirmwareEntry { package: String },

    /// A firmware URL could not be used.
    #[error("Invalid firmware URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A block or chunk index beyond the segmentation.
    #[error("Index {index} out of range (count {count})")]
    IndexOutOfRange { index: usize, count: usize },

    /// Segmentation cannot change once a transfer has started.
    #[error("Segmentation is locked while a transfer is running")]
    SegmentationLocked,

    /// Block size must be a non-zero multiple of a non-zero chunk size.
    #[error("Invalid segmentation: block size {block_size}, chunk size {chunk_size}")]
    InvalidSegmentation {
        block_size: usize,
        chunk_size: usize,
    },

    /// A read ran past the end of the buffer.
    #[error("Buffer underflow: need {needed} bytes at offset {offset}, buffer has {len}")]
    BufferUnderflow {
        offset: usize,
        needed: usize,
        len: usize,
    },

    /// The transport is not connected.
    #[error("Device is not connected")]
    NotConnected,

    /// A characteristic needed for the request was not discovered.
    #[error("Characteristic {0} not available")]
    MissingCharacteristic(Uuid),

    /// A transport-level GATT failure.
    #[error(transparent)]
    Gatt(#[from] GattError),

    /// The Bluetooth stack failed outside a GATT operation (adapter, scan, connect).
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    /// No advertising device matched.
    #[error("No device found matching '{0}'")]
    DeviceNotFound(String),

    /// The session task has stopped.
    #[error("Session closed")]
    SessionClosed,
}

impl SuotaError {
    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            SuotaError::Io(_) => "SUOTA-001",
            SuotaError::Zip(_) => "SUOTA-002",
            SuotaError::Json(_) => "SUOTA-003",
            SuotaError::UnrecognizedHeaderSignature(..) => "SUOTA-010",
            SuotaError::TruncatedHeader { .. } => "SUOTA-011",
            SuotaError::PayloadOutOfBounds { .. } => "SUOTA-012",
            SuotaError::HeaderChecksumInvalid { .. } => "SUOTA-013",
            SuotaError::EmptyFirmware => "SUOTA-020",
            SuotaError::MissingFirmwareEntry { .. } => "SUOTA-021",
            SuotaError::InvalidUrl { .. } => "SUOTA-022",
            SuotaError::IndexOutOfRange { .. } => "SUOTA-030",
            SuotaError::SegmentationLocked => "SUOTA-031",
            SuotaError::InvalidSegmentation { .. } => "SUOTA-032",
            SuotaError::BufferUnderflow { .. } => "SUOTA-033",
            SuotaError::NotConnected => "SUOTA-040",
            SuotaError::MissingCharacteristic(_) => "SUOTA-041",
            SuotaError::Gatt(_) => "SUOTA-042",
            SuotaError::Bluetooth(_) => "SUOTA-043",
            SuotaError::DeviceNotFound(_) => "SUOTA-044",
            SuotaError::SessionClosed => "SUOTA-050",
        }
    }

    /// Map onto the numeric failure taxonomy reported in failure events.
    pub fn failure_reason(&self) -> FailureReason {
        let app = match self {
            SuotaError::HeaderChecksumInvalid { .. } => ApplicationError::InvalidFirmwareCrc,
            SuotaError::NotConnected
            | SuotaError::SessionClosed
            | SuotaError::DeviceNotFound(_)
            | SuotaError::Gatt(GattError::Disconnected) => ApplicationError::NotConnected,
            SuotaError::Gatt(_)
            | SuotaError::Bluetooth(_)
            | SuotaError::MissingCharacteristic(_) => ApplicationError::GattOperationError,
            SuotaError::IndexOutOfRange { .. }
            | SuotaError::SegmentationLocked
            | SuotaError::InvalidSegmentation { .. }
            | SuotaError::BufferUnderflow { .. } => ApplicationError::ProtocolError,
            _ => ApplicationError::FirmwareLoadFailed,
        };
        FailureReason::Application(app)
    }
}

/// The single code carried by a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "camelCase")]
pub enum FailureReason {
    /// Code notified by the device (0x01-0x16, or any other unexpected status).
    Device(u8),
    /// Host-side failure.
    Application(ApplicationError),
}

impl FailureReason {
    pub fn code(&self) -> u16 {
        match self {
            FailureReason::Device(code) => u16::from(*code),
            FailureReason::Application(error) => error.code(),
        }
    }

    pub fn description(&self) -> String {
        match self {
            FailureReason::Device(code) => match DeviceError::from_byte(*code) {
                Some(error) => error.description().to_string(),
                None => format!("Unknown device status 0x{:02X}", code),
            },
            FailureReason::Application(error) => error.description().to_string(),
        }
    }
}

impl From<ApplicationError> for FailureReason {
    fn from(error: ApplicationError) -> Self {
        FailureReason::Application(error)
    }
}
