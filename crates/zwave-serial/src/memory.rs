//! Controller memory snapshot
//!
//! Diagnostic reads of controller memory land in a fixed 16 KiB buffer;
//! writes are issued from it. Reads larger than one frame are split into
//! chunks, each a separate memory-get-buffer job.

use crate::config::MEMORY_SNAPSHOT_SIZE;
use crate::error::{DriverError, Result};

/// Largest chunk requested by one memory-get-buffer job
pub const MEMORY_CHUNK_SIZE: usize = 64;

/// Fixed-size copy of controller memory
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    buffer: Box<[u8]>,
    bytes_read: usize,
}

impl Default for MemorySnapshot {
    fn default() -> Self {
        Self {
            buffer: vec![0u8; MEMORY_SNAPSHOT_SIZE].into_boxed_slice(),
            bytes_read: 0,
        }
    }
}

impl MemorySnapshot {
    /// Create a zeroed snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot size
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes stored from memory-get-buffer responses
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Read a range of the snapshot
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(&self.buffer[offset..offset + len])
    }

    /// Store bytes into the snapshot
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Store a memory-get-buffer response for the chunk at `offset`
    pub fn store_chunk(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.write(offset, data)?;
        self.bytes_read += data.len();
        Ok(())
    }

    /// Check that a range fits in the snapshot
    pub fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.buffer.len() => Ok(()),
            _ => Err(DriverError::MemoryOutOfRange {
                offset,
                len,
                size: self.buffer.len(),
            }),
        }
    }
}

/// Split `[offset, offset + len)` into memory-get-buffer chunks
pub fn chunks(offset: usize, len: usize) -> Result<impl Iterator<Item = (usize, usize)>> {
    let end = offset
        .checked_add(len)
        .ok_or(DriverError::MemoryOutOfRange {
            offset,
            len,
            size: MEMORY_SNAPSHOT_SIZE,
        })?;
    Ok((offset..end)
        .step_by(MEMORY_CHUNK_SIZE)
        .map(move |start| (start, MEMORY_CHUNK_SIZE.min(end - start))))
}

/// `[offset hi][offset lo][len]`
pub fn get_buffer_args(offset: usize, len: usize) -> Result<Vec<u8>> {
    let offset = u16::try_from(offset).map_err(|_| DriverError::InvalidArgument(format!(
        "memory offset {} does not fit 16 bits",
        offset
    )))?;
    let len = u8::try_from(len)
        .map_err(|_| DriverError::InvalidArgument(format!("memory chunk {} too long", len)))?;
    let [hi, lo] = offset.to_be_bytes();
    Ok(vec![hi, lo, len])
}

/// `[offset hi][offset lo][len hi][len lo][data...]`
pub fn put_buffer_args(offset: usize, data: &[u8]) -> Result<Vec<u8>> {
    let offset = u16::try_from(offset).map_err(|_| DriverError::InvalidArgument(format!(
        "memory offset {} does not fit 16 bits",
        offset
    )))?;
    let len = u16::try_from(data.len()).map_err(|_| {
        DriverError::InvalidArgument(format!("memory write {} too long", data.len()))
    })?;
    let mut args = Vec::with_capacity(data.len() + 4);
    args.extend_from_slice(&offset.to_be_bytes());
    args.extend_from_slice(&len.to_be_bytes());
    args.extend_from_slice(data);
    Ok(args)
}

/// Offset a memory-get-buffer job was issued for
pub fn offset_of(args: &[u8]) -> Option<usize> {
    match args {
        [hi, lo, ..] => Some(usize::from(u16::from_be_bytes([*hi, *lo]))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_bounds() {
        let mut snapshot = MemorySnapshot::new();
        assert_eq!(snapshot.size(), 16 * 1024);
        snapshot.write(16 * 1024 - 2, &[1, 2]).unwrap();
        assert_eq!(snapshot.read(16 * 1024 - 2, 2).unwrap(), &[1, 2]);

        let err = snapshot.write(16 * 1024 - 1, &[1, 2]).unwrap_err();
        assert_eq!(err.error_code(), "MEMORY_OUT_OF_RANGE");
        assert!(snapshot.read(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_chunks_cover_range() {
        let split: Vec<_> = chunks(100, 150).unwrap().collect();
        assert_eq!(split, vec![(100, 64), (164, 64), (228, 22)]);
        assert_eq!(chunks(0, 0).unwrap().count(), 0);
    }

    #[test]
    fn test_chunks_reject_overflowing_range() {
        let err = chunks(usize::MAX, 2).err().unwrap();
        assert_eq!(err.error_code(), "MEMORY_OUT_OF_RANGE");
    }

    #[test]
    fn test_buffer_args() {
        assert_eq!(get_buffer_args(0x1234, 64).unwrap(), vec![0x12, 0x34, 64]);
        assert_eq!(
            put_buffer_args(0x0010, &[0xAA, 0xBB]).unwrap(),
            vec![0x00, 0x10, 0x00, 0x02, 0xAA, 0xBB]
        );
        assert_eq!(offset_of(&[0x12, 0x34, 64]), Some(0x1234));
        assert!(get_buffer_args(0x1_0000, 1).is_err());
    }
}
