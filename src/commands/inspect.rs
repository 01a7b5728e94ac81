//! `inspect`: describe a firmware image without touching a device.

use serde::Serialize;
use std::path::Path;

use suota_updater::suota::{FirmwareHeader, FirmwareImage};

/// Header fields worth showing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderReport {
    pub layout: String,
    pub version: String,
    pub timestamp: Option<String>,
    pub payload_offset: usize,
    pub payload_size: usize,
    pub payload_crc: u32,
}

impl From<&FirmwareHeader> for HeaderReport {
    fn from(header: &FirmwareHeader) -> Self {
        Self {
            layout: header.kind().name().to_string(),
            version: header.version.clone(),
            timestamp: header.timestamp_utc().map(|t| t.to_rfc3339()),
            payload_offset: header.payload_offset,
            payload_size: header.payload_size,
            payload_crc: header.payload_crc,
        }
    }
}

/// Everything `inspect` reports about an image.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReport {
    pub name: String,
    pub file_size: usize,
    pub sha256: String,
    pub header: Option<HeaderReport>,
    /// None for headerless images.
    pub checksum_valid: Option<bool>,
    pub upload_size: usize,
    pub checksum: u8,
    pub block_size: usize,
    pub chunk_size: usize,
    pub total_blocks: usize,
    pub total_chunks: usize,
    pub last_block_size: usize,
}

/// Segment `image` and collect its report.
pub fn describe(
    image: &mut FirmwareImage,
    block_size: usize,
    chunk_size: usize,
) -> Result<ImageReport, String> {
    image
        .set_segmentation(block_size, chunk_size)
        .map_err(|e| format!("Invalid segmentation: {}", e))?;

    Ok(ImageReport {
        name: image.name().to_string(),
        file_size: image.data().len(),
        sha256: image.sha256(),
        header: image.header().map(HeaderReport::from),
        checksum_valid: image
            .header()
            .map(|_| image.verify_header_checksum().is_ok()),
        upload_size: image.upload_size(),
        checksum: image.checksum(),
        block_size: image.block_size(),
        chunk_size: image.chunk_size(),
        total_blocks: image.total_blocks(),
        total_chunks: image.total_chunks(),
        last_block_size: image.last_block_size(),
    })
}

pub fn run(path: &Path, block_size: usize, chunk_size: usize, json: bool) -> Result<(), String> {
    let mut image = FirmwareImage::from_path(path)
        .map_err(|e| format!("Failed to load firmware [{}]: {}", e.error_code(), e))?;
    let report = describe(&mut image, block_size, chunk_size)?;

    if json {
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| format!("Failed to encode report: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    println!("Image:        {} ({} bytes)", report.name, report.file_size);
    println!("SHA-256:      {}", report.sha256);
    match &report.header {
        Some(header) => {
            println!("Header:       {}", header.layout);
            println!("Version:      {}", header.version);
            if let Some(timestamp) = &header.timestamp {
                println!("Built:        {}", timestamp);
            }
            println!(
                "Payload:      {} bytes at offset {}",
                header.payload_size, header.payload_offset
            );
            let valid = report.checksum_valid.unwrap_or(false);
            println!(
                "Checksum:     0x{:02X} ({})",
                report.checksum,
                if valid { "valid" } else { "MISMATCH" }
            );
        }
        None => {
            println!("Header:       none");
            println!("Checksum:     0x{:02X}", report.checksum);
        }
    }
    println!(
        "Segmentation: {} blocks of {} bytes, {} chunks of {} bytes (last block {} bytes)",
        report.total_blocks,
        report.block_size,
        report.total_chunks,
        report.chunk_size,
        report.last_block_size
    );
    Ok(())
}
