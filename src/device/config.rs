//! Per-device configuration
//!
//! Plain data with serde derives so a config can be loaded from a JSON
//! document, a constructor for the common defaults, and `validate()`
//! as the single gate a config passes before a device is built on it.

use crate::storage::{Crc32Digest, Digest, Sha256Digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Integrity digest carried by replicated write payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    None,
    Crc32,
    Sha256,
}

/// When a replicated write completes back to the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// Complete once locally durable and handed to the send queue.
    WriteBehind,
    /// Complete once the peer has received the write.
    ReceiverAck,
    /// Complete once the peer reports the write durable on its disk.
    DiskAck,
}

/// What a write lost to a disconnect looks like to its submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LostWritePolicy {
    /// Locally durable, peer will catch up via resync.
    OutOfSync,
    /// Surface a hard failure.
    Fail,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device size must be a positive sector count")]
    ZeroSize,
    #[error("bytes per bitmap bit must be a power of two of at least 512, got {0}")]
    BadBitmapGranularity(u32),
    #[error("resync chunk size must be positive")]
    ZeroResyncChunk,
    #[error("{0} must be positive")]
    ZeroTimeout(&'static str),
    #[error("config document rejected: {0}")]
    BadDocument(String),
}

/// Static configuration of one replicated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Registry key; stable across reconfiguration.
    pub minor: u32,
    pub device_sectors: u64,
    /// Identity of this node, exchanged during the handshake and logged.
    #[serde(default = "Uuid::new_v4")]
    pub node_id: Uuid,
    /// Device bytes covered by one bitmap bit.
    #[serde(default = "default_bytes_per_bitmap_bit")]
    pub bytes_per_bitmap_bit: u32,
    #[serde(default = "default_durability")]
    pub durability: DurabilityMode,
    #[serde(default = "default_lost_write_policy")]
    pub lost_write_policy: LostWritePolicy,
    #[serde(default)]
    pub allow_two_primaries: bool,
    /// Integrity digest for replicated write payloads; both sides must
    /// configure the same kind.
    #[serde(default = "default_integrity_digest")]
    pub integrity_digest: DigestKind,
    /// An online-verify algorithm is configured.
    #[serde(default)]
    pub verify_configured: bool,
    #[serde(default = "default_net_timeout")]
    pub net_timeout_millis: u64,
    #[serde(default = "default_cluster_change_timeout")]
    pub cluster_change_timeout_millis: u64,
    /// Upper bound on one resync chunk, in bitmap blocks.
    #[serde(default = "default_max_resync_chunk")]
    pub max_resync_chunk_blocks: u64,
}

fn default_bytes_per_bitmap_bit() -> u32 {
    4096
}

fn default_integrity_digest() -> DigestKind {
    DigestKind::None
}

fn default_durability() -> DurabilityMode {
    DurabilityMode::DiskAck
}

fn default_lost_write_policy() -> LostWritePolicy {
    LostWritePolicy::OutOfSync
}

fn default_net_timeout() -> u64 {
    6_000
}

fn default_cluster_change_timeout() -> u64 {
    10_000
}

fn default_max_resync_chunk() -> u64 {
    32
}

impl DeviceConfig {
    pub fn new(minor: u32, device_sectors: u64) -> Self {
        Self {
            minor,
            device_sectors,
            node_id: Uuid::new_v4(),
            bytes_per_bitmap_bit: default_bytes_per_bitmap_bit(),
            durability: default_durability(),
            lost_write_policy: default_lost_write_policy(),
            allow_two_primaries: false,
            integrity_digest: default_integrity_digest(),
            verify_configured: false,
            net_timeout_millis: default_net_timeout(),
            cluster_change_timeout_millis: default_cluster_change_timeout(),
            max_resync_chunk_blocks: default_max_resync_chunk(),
        }
    }

    /// Parse a JSON config document and validate it.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig =
            serde_json::from_str(document).map_err(|e| ConfigError::BadDocument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_sectors == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if self.bytes_per_bitmap_bit < 512 || !self.bytes_per_bitmap_bit.is_power_of_two() {
            return Err(ConfigError::BadBitmapGranularity(self.bytes_per_bitmap_bit));
        }
        if self.max_resync_chunk_blocks == 0 {
            return Err(ConfigError::ZeroResyncChunk);
        }
        if self.net_timeout_millis == 0 {
            return Err(ConfigError::ZeroTimeout("net_timeout_millis"));
        }
        if self.cluster_change_timeout_millis == 0 {
            return Err(ConfigError::ZeroTimeout("cluster_change_timeout_millis"));
        }
        Ok(())
    }

    /// Digest implementation for the wire session, per the configured
    /// kind. The embedder hands this to
    /// [`Session::with_digest`](crate::proto::Session::with_digest).
    pub fn wire_digest(&self) -> Option<Box<dyn Digest>> {
        match self.integrity_digest {
            DigestKind::None => None,
            DigestKind::Crc32 => Some(Box::new(Crc32Digest)),
            DigestKind::Sha256 => Some(Box::new(Sha256Digest)),
        }
    }

    /// Sectors of device data covered by one bitmap bit.
    pub fn sectors_per_block(&self) -> u64 {
        u64::from(self.bytes_per_bitmap_bit) / 512
    }

    /// Bitmap size in blocks for this device.
    pub fn bitmap_blocks(&self) -> u64 {
        self.device_sectors.div_ceil(self.sectors_per_block())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DeviceConfig::new(0, 1 << 20);
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.sectors_per_block(), 8);
        assert_eq!(config.bitmap_blocks(), 1 << 17);
        assert!(!config.node_id.is_nil());
    }

    #[test]
    fn test_zero_size_rejected() {
        let config = DeviceConfig::new(0, 0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroSize));
    }

    #[test]
    fn test_bad_granularity_rejected() {
        let mut config = DeviceConfig::new(0, 1024);
        config.bytes_per_bitmap_bit = 3000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadBitmapGranularity(3000))
        ));
        config.bytes_per_bitmap_bit = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_tail_block_rounds_up() {
        let mut config = DeviceConfig::new(0, 12);
        config.bytes_per_bitmap_bit = 4096;
        assert_eq!(config.bitmap_blocks(), 2);
    }

    #[test]
    fn test_json_document_with_defaults() {
        let config = DeviceConfig::from_json(
            r#"{
                "minor": 2,
                "device_sectors": 2048,
                "durability": "WriteBehind",
                "allow_two_primaries": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.minor, 2);
        assert_eq!(config.durability, DurabilityMode::WriteBehind);
        assert!(config.allow_two_primaries);
        assert_eq!(config.bytes_per_bitmap_bit, 4096, "default applies");
        assert_eq!(config.lost_write_policy, LostWritePolicy::OutOfSync);
    }

    #[test]
    fn test_integrity_digest_kind_selects_the_implementation() {
        let mut config = DeviceConfig::new(0, 1024);
        assert!(config.wire_digest().is_none(), "off by default");

        config.integrity_digest = DigestKind::Crc32;
        assert_eq!(config.wire_digest().map(|d| d.digest_len()), Some(4));

        let config = DeviceConfig::from_json(
            r#"{"minor": 0, "device_sectors": 1024, "integrity_digest": "sha256"}"#,
        )
        .unwrap();
        assert_eq!(config.integrity_digest, DigestKind::Sha256);
        assert_eq!(config.wire_digest().map(|d| d.digest_len()), Some(32));
    }

    #[test]
    fn test_json_document_rejected_on_validation() {
        let err =
            DeviceConfig::from_json(r#"{"minor": 0, "device_sectors": 0}"#).unwrap_err();
        assert_eq!(err, ConfigError::ZeroSize);

        let err = DeviceConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, ConfigError::BadDocument(_)));
    }
}
