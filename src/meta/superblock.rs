//! The 512-byte on-disk metadata record
//!
//! Fixed layout, all integers big-endian:
//!
//! ```text
//! offset  size  field
//!      0     8  last agreed device size, sectors
//!      8    32  uuid chain: current, bitmap, history[0], history[1]
//!     40     8  device uuid
//!     48     8  reserved
//!     56     4  persistent flags
//!     60     4  magic
//!     64     4  metadata area size, sectors
//!     68     4  activity log offset, sectors (signed)
//!     72     4  activity log extent count
//!     76     4  bitmap offset, sectors (signed)
//!     80     4  bytes of device data per bitmap bit
//!     84    16  reserved
//!    100   412  zero padding
//! ```

use super::errors::{MetaError, MetaResult};
use super::uuids::UuidSet;

/// Identifies a metadata block written by this engine.
pub const META_MAGIC: u32 = 0x424d_4d44;

/// Record size; the record always occupies exactly one sector.
pub const META_BLOCK_SIZE: usize = 512;

/// Persistent flag bits.
pub const FLAG_CONSISTENT: u32 = 1 << 0;
pub const FLAG_WAS_PRIMARY: u32 = 1 << 1;
pub const FLAG_WAS_CONNECTED: u32 = 1 << 2;
pub const FLAG_FULL_SYNC_PENDING: u32 = 1 << 3;
pub const FLAG_WAS_UP_TO_DATE: u32 = 1 << 4;
pub const FLAG_PEER_OUTDATED: u32 = 1 << 5;
pub const FLAG_CRASHED_PRIMARY: u32 = 1 << 6;

/// Locally derived layout of the metadata area. A record whose stored
/// geometry disagrees with this was written for a different device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaGeometry {
    pub md_size_sectors: u32,
    pub activity_log_offset: i32,
    pub activity_log_extents: u32,
    pub bitmap_offset: i32,
    pub bytes_per_bitmap_bit: u32,
}

/// In-memory image of the metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Device size both sides last agreed on, in sectors.
    pub effective_size_sectors: u64,
    pub uuids: UuidSet,
    pub device_uuid: u64,
    pub flags: u32,
    pub geometry: MetaGeometry,
}

impl Superblock {
    pub fn new(device_uuid: u64, geometry: MetaGeometry) -> Self {
        Self {
            effective_size_sectors: 0,
            uuids: UuidSet::new(),
            device_uuid,
            flags: 0,
            geometry,
        }
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Serialize into one 512-byte block.
    pub fn encode(&self) -> [u8; META_BLOCK_SIZE] {
        let mut block = [0u8; META_BLOCK_SIZE];
        let mut w = FieldWriter::new(&mut block);
        w.u64(self.effective_size_sectors);
        w.u64(self.uuids.current);
        w.u64(self.uuids.bitmap);
        w.u64(self.uuids.history[0]);
        w.u64(self.uuids.history[1]);
        w.u64(self.device_uuid);
        w.u64(0); // reserved
        w.u32(self.flags);
        w.u32(META_MAGIC);
        w.u32(self.geometry.md_size_sectors);
        w.i32(self.geometry.activity_log_offset);
        w.u32(self.geometry.activity_log_extents);
        w.i32(self.geometry.bitmap_offset);
        w.u32(self.geometry.bytes_per_bitmap_bit);
        // 16 reserved bytes and padding stay zero
        block
    }

    /// Parse and validate a record against the locally expected
    /// geometry.
    pub fn decode(block: &[u8], expected: MetaGeometry) -> MetaResult<Superblock> {
        if block.len() != META_BLOCK_SIZE {
            return Err(MetaError::WrongLength {
                len: block.len(),
                expected: META_BLOCK_SIZE,
            });
        }
        let mut r = FieldReader::new(block);
        let effective_size_sectors = r.u64();
        let uuids = UuidSet {
            current: r.u64(),
            bitmap: r.u64(),
            history: [r.u64(), r.u64()],
        };
        let device_uuid = r.u64();
        let _reserved = r.u64();
        let flags = r.u32();
        let magic = r.u32();
        if magic != META_MAGIC {
            return Err(MetaError::BadMagic {
                found: magic,
                expected: META_MAGIC,
            });
        }
        let geometry = MetaGeometry {
            md_size_sectors: r.u32(),
            activity_log_offset: r.i32(),
            activity_log_extents: r.u32(),
            bitmap_offset: r.i32(),
            bytes_per_bitmap_bit: r.u32(),
        };
        check_geometry(geometry, expected)?;
        Ok(Superblock {
            effective_size_sectors,
            uuids,
            device_uuid,
            flags,
            geometry,
        })
    }
}

fn check_geometry(stored: MetaGeometry, expected: MetaGeometry) -> MetaResult<()> {
    let pairs: [(&'static str, i64, i64); 5] = [
        (
            "md_size_sectors",
            i64::from(stored.md_size_sectors),
            i64::from(expected.md_size_sectors),
        ),
        (
            "activity_log_offset",
            i64::from(stored.activity_log_offset),
            i64::from(expected.activity_log_offset),
        ),
        (
            "activity_log_extents",
            i64::from(stored.activity_log_extents),
            i64::from(expected.activity_log_extents),
        ),
        (
            "bitmap_offset",
            i64::from(stored.bitmap_offset),
            i64::from(expected.bitmap_offset),
        ),
        (
            "bytes_per_bitmap_bit",
            i64::from(stored.bytes_per_bitmap_bit),
            i64::from(expected.bytes_per_bitmap_bit),
        ),
    ];
    for (field, stored, expected) in pairs {
        if stored != expected {
            return Err(MetaError::GeometryMismatch {
                field,
                stored,
                expected,
            });
        }
    }
    Ok(())
}

struct FieldWriter<'a> {
    block: &'a mut [u8],
    at: usize,
}

impl<'a> FieldWriter<'a> {
    fn new(block: &'a mut [u8]) -> Self {
        Self { block, at: 0 }
    }

    fn u64(&mut self, v: u64) {
        self.block[self.at..self.at + 8].copy_from_slice(&v.to_be_bytes());
        self.at += 8;
    }

    fn u32(&mut self, v: u32) {
        self.block[self.at..self.at + 4].copy_from_slice(&v.to_be_bytes());
        self.at += 4;
    }

    fn i32(&mut self, v: i32) {
        self.block[self.at..self.at + 4].copy_from_slice(&v.to_be_bytes());
        self.at += 4;
    }
}

struct FieldReader<'a> {
    block: &'a [u8],
    at: usize,
}

impl<'a> FieldReader<'a> {
    fn new(block: &'a [u8]) -> Self {
        Self { block, at: 0 }
    }

    fn u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.block[self.at..self.at + 8]);
        self.at += 8;
        u64::from_be_bytes(buf)
    }

    fn u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.block[self.at..self.at + 4]);
        self.at += 4;
        u32::from_be_bytes(buf)
    }

    fn i32(&mut self) -> i32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.block[self.at..self.at + 4]);
        self.at += 4;
        i32::from_be_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> MetaGeometry {
        MetaGeometry {
            md_size_sectors: 264,
            activity_log_offset: 8,
            activity_log_extents: 257,
            bitmap_offset: 72,
            bytes_per_bitmap_bit: 4096,
        }
    }

    fn sample() -> Superblock {
        let mut sb = Superblock::new(0xdead_beef_cafe_0042, geometry());
        sb.effective_size_sectors = 1 << 21;
        sb.uuids.current = 0x1111_2222_3333_4445;
        sb.uuids.bitmap = 0x0abc;
        sb.uuids.history = [0x0def, 0x0123];
        sb.set_flag(FLAG_CONSISTENT);
        sb.set_flag(FLAG_WAS_PRIMARY);
        sb
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let sb = sample();
        let block = sb.encode();
        assert_eq!(Superblock::decode(&block, geometry()).unwrap(), sb);
    }

    #[test]
    fn test_encoding_is_big_endian_at_fixed_offsets() {
        let sb = sample();
        let block = sb.encode();
        assert_eq!(&block[0..8], &(1u64 << 21).to_be_bytes());
        assert_eq!(&block[60..64], &META_MAGIC.to_be_bytes());
        assert_eq!(&block[80..84], &4096u32.to_be_bytes());
        assert!(block[100..].iter().all(|&b| b == 0), "padding must be zero");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut block = sample().encode();
        block[60] ^= 0xff;
        let err = Superblock::decode(&block, geometry()).unwrap_err();
        assert!(matches!(err, MetaError::BadMagic { .. }));
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let block = sample().encode();
        let mut other = geometry();
        other.bitmap_offset = 80;
        let err = Superblock::decode(&block, other).unwrap_err();
        assert_eq!(
            err,
            MetaError::GeometryMismatch {
                field: "bitmap_offset",
                stored: 72,
                expected: 80
            }
        );
    }

    #[test]
    fn test_truncated_record_rejected() {
        let block = sample().encode();
        let err = Superblock::decode(&block[..511], geometry()).unwrap_err();
        assert!(matches!(err, MetaError::WrongLength { len: 511, .. }));
    }

    #[test]
    fn test_flag_helpers() {
        let mut sb = sample();
        assert!(sb.has_flag(FLAG_CONSISTENT));
        sb.clear_flag(FLAG_CONSISTENT);
        assert!(!sb.has_flag(FLAG_CONSISTENT));
        assert!(sb.has_flag(FLAG_WAS_PRIMARY));
    }
}
