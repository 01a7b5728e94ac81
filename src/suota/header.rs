//! Firmware image header parsing.
//!
//! Three header generations exist, each picked by its 2-byte signature:
//!
//! | Layout  | Signature   | Size | Payload size | CRC | Version | Timestamp |
//! |---------|-------------|------|--------------|-----|---------|-----------|
//! | DA1458x | `0x70 0x51` | 64   | @4           | @8  | @12     | @28       |
//! | DA1468x | `0x70 0x61` | 36   | @4           | @8  | @12     | @28       |
//! | DA1469x | `0x51 0x71` | 34   | @2           | @6  | @10     | @26       |
//!
//! All multi-byte fields are little-endian. Layout-specific fields live in
//! [`HeaderLayout`] and never share positions across generations.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::byte_cursor::ByteCursor;
use super::error::{SuotaError, SuotaResult};

/// Length of the signature at the start of every header.
pub const SIGNATURE_LENGTH: usize = 2;

/// Length of the NUL-padded version field.
pub const VERSION_LENGTH: usize = 16;

/// Header generation, one per signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HeaderKind {
    Da1458x,
    Da1468x,
    Da1469x,
}

/// Field offsets shared by every layout.
struct LayoutOffsets {
    kind: HeaderKind,
    signature: [u8; 2],
    header_size: usize,
    payload_size: usize,
    payload_crc: usize,
    version: usize,
    timestamp: usize,
}

const LAYOUTS: [LayoutOffsets; 3] = [
    LayoutOffsets {
        kind: HeaderKind::Da1458x,
        signature: [0x70, 0x51],
        header_size: 64,
        payload_size: 4,
        payload_crc: 8,
        version: 12,
        timestamp: 28,
    },
    LayoutOffsets {
        kind: HeaderKind::Da1468x,
        signature: [0x70, 0x61],
        header_size: 36,
        payload_size: 4,
        payload_crc: 8,
        version: 12,
        timestamp: 28,
    },
    LayoutOffsets {
        kind: HeaderKind::Da1469x,
        signature: [0x51, 0x71],
        header_size: 34,
        payload_size: 2,
        payload_crc: 6,
        version: 10,
        timestamp: 26,
    },
];

impl HeaderKind {
    /// Match the first two bytes of an image against the known signatures.
    pub fn detect(data: &[u8]) -> Option<Self> {
        let signature = data.get(..SIGNATURE_LENGTH)?;
        LAYOUTS
            .iter()
            .find(|layout| layout.signature == signature)
            .map(|layout| layout.kind)
    }

    pub fn signature(&self) -> [u8; 2] {
        self.offsets().signature
    }

    pub fn header_size(&self) -> usize {
        self.offsets().header_size
    }

    /// Position of the 32-bit CRC field.
    pub fn crc_offset(&self) -> usize {
        self.offsets().payload_crc
    }

    /// Short product family name.
    pub fn name(&self) -> &'static str {
        match self {
            HeaderKind::Da1458x => "585",
            HeaderKind::Da1468x => "68x",
            HeaderKind::Da1469x => "69x",
        }
    }

    fn offsets(&self) -> &'static LayoutOffsets {
        match self {
            HeaderKind::Da1458x => &LAYOUTS[0],
            HeaderKind::Da1468x => &LAYOUTS[1],
            HeaderKind::Da1469x => &LAYOUTS[2],
        }
    }
}

/// Fields that only exist in one header generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", rename_all = "camelCase")]
pub enum HeaderLayout {
    Da1458x {
        valid_flag: u8,
        image_id: u8,
        encryption: u8,
    },
    Da1468x {
        flags: u16,
        exec_location: u32,
    },
    Da1469x {
        pointer_to_ivt: u32,
    },
}

impl HeaderLayout {
    pub fn kind(&self) -> HeaderKind {
        match self {
            HeaderLayout::Da1458x { .. } => HeaderKind::Da1458x,
            HeaderLayout::Da1468x { .. } => HeaderKind::Da1468x,
            HeaderLayout::Da1469x { .. } => HeaderKind::Da1469x,
        }
    }
}

/// Decoded firmware image header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareHeader {
    pub header_size: usize,
    /// Offset of the first payload byte in the file.
    pub payload_offset: usize,
    pub payload_size: usize,
    pub payload_crc: u32,
    pub version_raw: [u8; VERSION_LENGTH],
    /// Version text up to the first NUL.
    pub version: String,
    /// Build time in seconds since the Unix epoch.
    pub timestamp: u32,
    pub layout: HeaderLayout,
}

impl FirmwareHeader {
    /// Decode the header at the start of `data`.
    ///
    /// Fails with `UnrecognizedHeaderSignature` when no layout matches,
    /// `TruncatedHeader` when the buffer is shorter than the layout, and
    /// `PayloadOutOfBounds` when the declared payload overruns the file.
    pub fn parse(data: &[u8]) -> SuotaResult<Self> {
        if data.len() < SIGNATURE_LENGTH {
            return Err(SuotaError::TruncatedHeader {
                needed: SIGNATURE_LENGTH,
                actual: data.len(),
            });
        }
        let kind = HeaderKind::detect(data)
            .ok_or(SuotaError::UnrecognizedHeaderSignature(data[0], data[1]))?;
        let offsets = kind.offsets();
        if data.len() < offsets.header_size {
            return Err(SuotaError::TruncatedHeader {
                needed: offsets.header_size,
                actual: data.len(),
            });
        }

        let cursor = ByteCursor::new(&data[..offsets.header_size]);
        let payload_size = cursor.u32_at(offsets.payload_size)? as usize;
        let payload_crc = cursor.u32_at(offsets.payload_crc)?;
        let timestamp = cursor.u32_at(offsets.timestamp)?;

        let mut version_raw = [0u8; VERSION_LENGTH];
        version_raw.copy_from_slice(cursor.bytes_at(offsets.version, VERSION_LENGTH)?);
        let version_end = version_raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_LENGTH);
        let version = String::from_utf8_lossy(&version_raw[..version_end])
            .trim()
            .to_string();

        let layout = match kind {
            HeaderKind::Da1458x => HeaderLayout::Da1458x {
                valid_flag: cursor.u8_at(2)?,
                image_id: cursor.u8_at(3)?,
                encryption: cursor.u8_at(32)?,
            },
            HeaderKind::Da1468x => HeaderLayout::Da1468x {
                flags: cursor.u16_at(2)?,
                exec_location: cursor.u32_at(32)?,
            },
            HeaderKind::Da1469x => HeaderLayout::Da1469x {
                pointer_to_ivt: cursor.u32_at(30)?,
            },
        };

        // The 69x payload starts at the interrupt vector table, not right after the header.
        let payload_offset = match layout {
            HeaderLayout::Da1469x { pointer_to_ivt } => {
                (pointer_to_ivt as usize).max(offsets.header_size)
            }
            _ => offsets.header_size,
        };

        let fits = payload_offset
            .checked_add(payload_size)
            .is_some_and(|end| end <= data.len());
        if !fits {
            return Err(SuotaError::PayloadOutOfBounds {
                offset: payload_offset,
                payload_size,
                file_size: data.len(),
            });
        }

        Ok(Self {
            header_size: offsets.header_size,
            payload_offset,
            payload_size,
            payload_crc,
            version_raw,
            version,
            timestamp,
            layout,
        })
    }

    pub fn kind(&self) -> HeaderKind {
        self.layout.kind()
    }

    /// Byte range of the payload inside the file.
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        self.payload_offset..self.payload_offset + self.payload_size
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0)
    }

    /// Byte range the header checksum covers: file start to payload end.
    pub fn checksum_range(&self) -> std::ops::Range<usize> {
        0..self.payload_offset + self.payload_size
    }

    /// Checksum byte stored in the low byte of the CRC field.
    pub fn expected_checksum(&self) -> u8 {
        (self.payload_crc & 0xFF) as u8
    }

    /// XOR-8 over header and payload. The CRC field itself counts as zero.
    pub fn compute_checksum(&self, data: &[u8]) -> SuotaResult<u8> {
        let region = data
            .get(self.checksum_range())
            .ok_or(SuotaError::PayloadOutOfBounds {
                offset: self.payload_offset,
                payload_size: self.payload_size,
                file_size: data.len(),
            })?;
        let crc_offset = self.kind().crc_offset();
        let crc_field = crc_offset..crc_offset + 4;
        Ok(region
            .iter()
            .enumerate()
            .filter(|(i, _)| !crc_field.contains(i))
            .fold(0u8, |acc, (_, &b)| acc ^ b))
    }

    /// Recompute the header checksum of `data` and compare it with the stored one.
    pub fn verify_checksum(&self, data: &[u8]) -> SuotaResult<()> {
        let actual = self.compute_checksum(data)?;
        let expected = self.expected_checksum();
        if actual != expected {
            return Err(SuotaError::HeaderChecksumInvalid { expected, actual });
        }
        Ok(())
    }
}

/// Running 8-bit exclusive-or over `bytes`.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}
