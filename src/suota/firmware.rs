//! Firmware image loading and block/chunk segmentation.
//!
//! An image is read once from a buffer, a file, a `.zip` package or a
//! `file://` URL, and never changes afterwards. Segmentation into blocks and
//! chunks is computed lazily on first use and cached; it can be re-parameterised
//! until the image is locked for a transfer.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use sha2::{Digest, Sha256};

use super::config::{DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE, MAX_BLOCK_SIZE};
use super::error::{SuotaError, SuotaResult};
use super::header::{xor_checksum, FirmwareHeader, HeaderKind};

/// File extensions accepted as image entries inside a package.
const IMAGE_EXTENSIONS: &[&str] = &["img", "bin"];

/// Block/chunk partition of the upload region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmentation {
    pub block_size: usize,
    pub chunk_size: usize,
    pub total_blocks: usize,
    /// Size of the final block; equals `block_size` when the upload divides evenly.
    pub last_block_size: usize,
    /// Chunks in every block but the last.
    pub chunks_per_block: usize,
    pub last_block_chunks: usize,
    pub total_chunks: usize,
}

impl Segmentation {
    fn compute(upload_size: usize, block_size: usize, chunk_size: usize) -> Self {
        let total_blocks = upload_size.div_ceil(block_size);
        let last_block_size = match upload_size % block_size {
            0 => block_size,
            rest => rest,
        };
        let chunks_per_block = block_size / chunk_size;
        let last_block_chunks = last_block_size.div_ceil(chunk_size);
        Self {
            block_size,
            chunk_size,
            total_blocks,
            last_block_size,
            chunks_per_block,
            last_block_chunks,
            total_chunks: (total_blocks - 1) * chunks_per_block + last_block_chunks,
        }
    }
}

/// One block of the upload, borrowed from the image.
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    index: usize,
    bytes: &'a [u8],
    chunk_size: usize,
}

impl<'a> Block<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.bytes.len().div_ceil(self.chunk_size)
    }

    /// Chunks in write order; all but the very last of the image are `chunk_size` long.
    pub fn chunks(&self) -> std::slice::Chunks<'a, u8> {
        self.bytes.chunks(self.chunk_size)
    }

    pub fn chunk(&self, index: usize) -> SuotaResult<&'a [u8]> {
        self.chunks().nth(index).ok_or(SuotaError::IndexOutOfRange {
            index,
            count: self.chunk_count(),
        })
    }
}

/// Firmware bytes plus their optional header.
#[derive(Clone)]
pub struct FirmwareImage {
    name: String,
    data: Arc<[u8]>,
    header: Option<FirmwareHeader>,
    block_size: usize,
    chunk_size: usize,
    segmentation: OnceLock<Segmentation>,
    locked: bool,
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .field("header", &self.header.as_ref().map(FirmwareHeader::kind))
            .field("block_size", &self.block_size)
            .field("chunk_size", &self.chunk_size)
            .field("locked", &self.locked)
            .finish()
    }
}

impl FirmwareImage {
    /// Build an image from an in-memory buffer.
    ///
    /// A buffer starting with a known signature must carry a valid header;
    /// anything else is uploaded as-is.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> SuotaResult<Self> {
        let header = match HeaderKind::detect(&data) {
            Some(_) => Some(FirmwareHeader::parse(&data)?),
            None => None,
        };
        let upload_size = header
            .as_ref()
            .map_or(data.len(), |header| header.payload_size);
        if upload_size == 0 {
            return Err(SuotaError::EmptyFirmware);
        }

        Ok(Self {
            name: name.into(),
            data: data.into(),
            header,
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            segmentation: OnceLock::new(),
            locked: false,
        })
    }

    /// Load an image file, or the first image entry of a `.zip` package.
    pub fn from_path<P: AsRef<Path>>(path: P) -> SuotaResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if has_extension(path, "zip") {
            let (entry_name, data) = read_package(path)?;
            return Self::from_bytes(entry_name, data);
        }

        let data = std::fs::read(path)?;
        Self::from_bytes(name, data)
    }

    /// Load an image from a `file://` URL.
    pub fn from_url(url: &str) -> SuotaResult<Self> {
        let parsed = url::Url::parse(url).map_err(|e| SuotaError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "file" {
            return Err(SuotaError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        let path = parsed.to_file_path().map_err(|_| SuotaError::InvalidUrl {
            url: url.to_string(),
            reason: "not a local path".to_string(),
        })?;
        Self::from_path(path)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The whole file as loaded.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn header(&self) -> Option<&FirmwareHeader> {
        self.header.as_ref()
    }

    /// Bytes sent to the device: the payload when a header is present, else the whole file.
    pub fn upload_data(&self) -> &[u8] {
        match &self.header {
            Some(header) => &self.data[header.payload_range()],
            None => &self.data,
        }
    }

    pub fn upload_size(&self) -> usize {
        self.upload_data().len()
    }

    /// 8-bit XOR over the upload region.
    pub fn checksum(&self) -> u8 {
        xor_checksum(self.upload_data())
    }

    /// Hex SHA-256 of the whole file.
    pub fn sha256(&self) -> String {
        let digest = Sha256::digest(&self.data);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Check the header's payload checksum. Headerless images always pass.
    pub fn verify_header_checksum(&self) -> SuotaResult<()> {
        match &self.header {
            Some(header) => header.verify_checksum(&self.data),
            None => Ok(()),
        }
    }

    /// Change block and chunk sizes. Fails once the image is locked.
    ///
    /// The block size must be a non-zero multiple of the chunk size and fit
    /// the 16-bit patch length.
    pub fn set_segmentation(&mut self, block_size: usize, chunk_size: usize) -> SuotaResult<()> {
        if self.locked {
            return Err(SuotaError::SegmentationLocked);
        }
        if chunk_size == 0
            || block_size == 0
            || block_size > MAX_BLOCK_SIZE
            || block_size % chunk_size != 0
        {
            return Err(SuotaError::InvalidSegmentation {
                block_size,
                chunk_size,
            });
        }
        if (block_size, chunk_size) != (self.block_size, self.chunk_size) {
            self.block_size = block_size;
            self.chunk_size = chunk_size;
            self.segmentation = OnceLock::new();
        }
        Ok(())
    }

    /// Freeze segmentation for the duration of a transfer.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Block/chunk partition, computed once.
    pub fn segment(&self) -> &Segmentation {
        self.segmentation.get_or_init(|| {
            Segmentation::compute(self.upload_size(), self.block_size, self.chunk_size)
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_blocks(&self) -> usize {
        self.segment().total_blocks
    }

    pub fn total_chunks(&self) -> usize {
        self.segment().total_chunks
    }

    pub fn last_block_size(&self) -> usize {
        self.segment().last_block_size
    }

    pub fn block_len(&self, index: usize) -> SuotaResult<usize> {
        self.block_at(index).map(|block| block.len())
    }

    pub fn chunks_in_block(&self, index: usize) -> SuotaResult<usize> {
        self.block_at(index).map(|block| block.chunk_count())
    }

    /// The block at `index`.
    pub fn block_at(&self, index: usize) -> SuotaResult<Block<'_>> {
        let segmentation = *self.segment();
        if index >= segmentation.total_blocks {
            return Err(SuotaError::IndexOutOfRange {
                index,
                count: segmentation.total_blocks,
            });
        }
        let start = index * segmentation.block_size;
        let end = (start + segmentation.block_size).min(self.upload_size());
        Ok(Block {
            index,
            bytes: &self.upload_data()[start..end],
            chunk_size: segmentation.chunk_size,
        })
    }

    pub fn chunk_at(&self, block: usize, chunk: usize) -> SuotaResult<&[u8]> {
        self.block_at(block)?.chunk(chunk)
    }

    pub fn is_last_block(&self, index: usize) -> bool {
        index + 1 == self.total_blocks()
    }

    /// Whether `chunk` is the final chunk of `block`.
    pub fn is_last_chunk(&self, block: usize, chunk: usize) -> bool {
        self.chunks_in_block(block)
            .is_ok_and(|count| chunk + 1 == count)
    }

    /// Whether chunk `n`, counted across the whole upload from zero, is the final one.
    pub fn is_last_chunk_overall(&self, n: usize) -> bool {
        n + 1 == self.total_chunks()
    }

    pub fn is_last_block_shorter(&self) -> bool {
        self.last_block_size() < self.block_size
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

/// Read the first image entry of a package, in archive order.
fn read_package(path: &Path) -> SuotaResult<(String, Vec<u8>)> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        if !IMAGE_EXTENSIONS
            .iter()
            .any(|ext| has_extension(Path::new(&entry_name), ext))
        {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        return Ok((entry_name, data));
    }

    Err(SuotaError::MissingFirmwareEntry {
        package: path.display().to_string(),
    })
}
