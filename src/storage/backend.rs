//! The [`BlockStorage`] trait and the in-memory reference backend

use super::errors::{StorageError, StorageResult};

/// Sector size in bytes. All offsets and lengths the engine handles are
/// expressed in sectors of this size.
pub const SECTOR_SIZE: usize = 512;

/// A backing store addressed by 512-byte sectors.
///
/// Implementations must be safe to share across threads; the engine
/// serializes writes per connection but reads may be concurrent.
pub trait BlockStorage: Send + Sync {
    /// Device capacity in sectors.
    fn capacity_sectors(&self) -> u64;

    /// Read `buf.len()` bytes starting at `sector`. `buf.len()` must be
    /// a multiple of [`SECTOR_SIZE`].
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Write `buf` starting at `sector`. `buf.len()` must be a multiple
    /// of [`SECTOR_SIZE`].
    fn write_sectors(&self, sector: u64, buf: &[u8]) -> StorageResult<()>;

    /// Durably flush all previously written data.
    fn flush(&self) -> StorageResult<()>;
}

/// Volatile in-memory block device.
///
/// Used by the integration suites to stand in for a real disk; writes
/// are immediately "durable" and flush is a no-op.
pub struct MemoryDisk {
    sectors: std::sync::RwLock<Vec<u8>>,
    capacity: u64,
}

impl MemoryDisk {
    /// Create a zero-filled device of `capacity` sectors.
    pub fn new(capacity: u64) -> Self {
        Self {
            sectors: std::sync::RwLock::new(vec![0u8; capacity as usize * SECTOR_SIZE]),
            capacity,
        }
    }

    fn check_range(&self, sector: u64, len: usize) -> StorageResult<()> {
        let count = (len / SECTOR_SIZE) as u64;
        if sector.checked_add(count).map_or(true, |end| end > self.capacity) {
            return Err(StorageError::OutOfBounds {
                sector,
                count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl BlockStorage for MemoryDisk {
    fn capacity_sectors(&self) -> u64 {
        self.capacity
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.check_range(sector, buf.len())?;
        let data = self.sectors.read().map_err(|_| StorageError::ReadFailed {
            sector,
            reason: "poisoned lock".to_string(),
        })?;
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> StorageResult<()> {
        self.check_range(sector, buf.len())?;
        let mut data = self.sectors.write().map_err(|_| StorageError::WriteFailed {
            sector,
            reason: "poisoned lock".to_string(),
        })?;
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}
