//! Endian-aware cursor over a byte buffer.
//!
//! `ByteCursor` reads primitives from a borrowed slice, `ByteWriter` builds
//! an owned payload. All header fields and characteristic values go through
//! these two types.

use super::error::{SuotaError, SuotaResult};

/// Byte order for multi-byte reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

/// Read cursor over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    position: usize,
    order: ByteOrder,
}

impl<'a> ByteCursor<'a> {
    /// Little-endian cursor at offset 0.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_order(data, ByteOrder::LittleEndian)
    }

    pub fn with_order(data: &'a [u8], order: ByteOrder) -> Self {
        Self {
            data,
            position: 0,
            order,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Move to an absolute offset. Seeking to the end is allowed.
    pub fn seek(&mut self, position: usize) -> SuotaResult<()> {
        if position > self.data.len() {
            return Err(self.underflow(position, 0));
        }
        self.position = position;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> SuotaResult<()> {
        self.take(count).map(|_| ())
    }

    /// Borrow the next `count` bytes and advance.
    pub fn read_bytes(&mut self, count: usize) -> SuotaResult<&'a [u8]> {
        self.take(count)
    }

    /// Borrow `count` bytes at `offset` without moving the cursor.
    pub fn bytes_at(&self, offset: usize, count: usize) -> SuotaResult<&'a [u8]> {
        let end = offset
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| self.underflow(offset, count))?;
        Ok(&self.data[offset..end])
    }

    pub fn read_u8(&mut self) -> SuotaResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> SuotaResult<u16> {
        let bytes = self.array::<2>()?;
        Ok(match self.order {
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
        })
    }

    pub fn read_u32(&mut self) -> SuotaResult<u32> {
        let bytes = self.array::<4>()?;
        Ok(match self.order {
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
        })
    }

    pub fn read_u64(&mut self) -> SuotaResult<u64> {
        let bytes = self.array::<8>()?;
        Ok(match self.order {
            ByteOrder::LittleEndian => u64::from_le_bytes(bytes),
            ByteOrder::BigEndian => u64::from_be_bytes(bytes),
        })
    }

    /// Read a u8 at an absolute offset without moving the cursor.
    pub fn u8_at(&self, offset: usize) -> SuotaResult<u8> {
        Ok(self.bytes_at(offset, 1)?[0])
    }

    /// Read a u16 at an absolute offset without moving the cursor.
    pub fn u16_at(&self, offset: usize) -> SuotaResult<u16> {
        let mut cursor = self.clone();
        cursor.seek(offset)?;
        cursor.read_u16()
    }

    /// Read a u32 at an absolute offset without moving the cursor.
    pub fn u32_at(&self, offset: usize) -> SuotaResult<u32> {
        let mut cursor = self.clone();
        cursor.seek(offset)?;
        cursor.read_u32()
    }

    fn array<const N: usize>(&mut self) -> SuotaResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take(&mut self, count: usize) -> SuotaResult<&'a [u8]> {
        let slice = self.bytes_at(self.position, count)?;
        self.position += count;
        Ok(slice)
    }

    fn underflow(&self, offset: usize, needed: usize) -> SuotaError {
        SuotaError::BufferUnderflow {
            offset,
            needed,
            len: self.data.len(),
        }
    }
}

/// Growable write buffer with a fixed byte order.
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    data: Vec<u8>,
    order: ByteOrder,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(order: ByteOrder) -> Self {
        Self {
            data: Vec::new(),
            order,
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        match self.order {
            ByteOrder::LittleEndian => self.data.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::BigEndian => self.data.extend_from_slice(&value.to_be_bytes()),
        }
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        match self.order {
            ByteOrder::LittleEndian => self.data.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::BigEndian => self.data.extend_from_slice(&value.to_be_bytes()),
        }
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        match self.order {
            ByteOrder::LittleEndian => self.data.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::BigEndian => self.data.extend_from_slice(&value.to_be_bytes()),
        }
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Zero-pad up to `len` bytes. No-op when already longer.
    pub fn pad_to(&mut self, len: usize) -> &mut Self {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Encode a u32 as little-endian bytes (sentinels, memory/GPIO configuration).
pub fn u32_le(value: u32) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.put_u32(value);
    writer.into_bytes()
}
