//! Fixed packet header
//!
//! Eight bytes on the wire: 4-byte magic, 2-byte command code, 2-byte
//! payload length. The length excludes the header. All big-endian.

use super::errors::{ProtoError, ProtoResult};

/// Identifies packets spoken by this engine.
pub const WIRE_MAGIC: u32 = 0x424d_4952;

/// Header size on the wire.
pub const HEADER_LEN: usize = 8;

/// Largest payload the 16-bit length field can frame.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Wire command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Data = 0x0000,
    DataAck = 0x0001,
    Barrier = 0x0002,
    BarrierAck = 0x0003,
    StateBroadcast = 0x0004,
    StateChangeRequest = 0x0005,
    StateChangeReply = 0x0006,
    UuidSet = 0x0007,
    Sizes = 0x0008,
    BitmapCompressed = 0x0009,
    BitmapPlain = 0x000a,
    SyncUuid = 0x000b,
}

impl Command {
    pub fn from_code(code: u16) -> Option<Command> {
        use Command::*;
        Some(match code {
            0x0000 => Data,
            0x0001 => DataAck,
            0x0002 => Barrier,
            0x0003 => BarrierAck,
            0x0004 => StateBroadcast,
            0x0005 => StateChangeRequest,
            0x0006 => StateChangeReply,
            0x0007 => UuidSet,
            0x0008 => Sizes,
            0x0009 => BitmapCompressed,
            0x000a => BitmapPlain,
            0x000b => SyncUuid,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use Command::*;
        match self {
            Data => "Data",
            DataAck => "DataAck",
            Barrier => "Barrier",
            BarrierAck => "BarrierAck",
            StateBroadcast => "StateBroadcast",
            StateChangeRequest => "StateChangeRequest",
            StateChangeReply => "StateChangeReply",
            UuidSet => "UuidSet",
            Sizes => "Sizes",
            BitmapCompressed => "BitmapCompressed",
            BitmapPlain => "BitmapPlain",
            SyncUuid => "SyncUuid",
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub length: u16,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&WIRE_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&(self.command as u16).to_be_bytes());
        buf[6..8].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> ProtoResult<Header> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != WIRE_MAGIC {
            return Err(ProtoError::BadMagic { found: magic });
        }
        let code = u16::from_be_bytes([buf[4], buf[5]]);
        let command = Command::from_code(code).ok_or(ProtoError::UnknownCommand { code })?;
        let length = u16::from_be_bytes([buf[6], buf[7]]);
        Ok(Header { command, length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            command: Command::BarrierAck,
            length: 8,
        };
        let buf = header.encode();
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_wire_layout() {
        let header = Header {
            command: Command::Data,
            length: 0x1234,
        };
        let buf = header.encode();
        assert_eq!(&buf[0..4], &[0x42, 0x4d, 0x49, 0x52]);
        assert_eq!(&buf[4..6], &[0x00, 0x00]);
        assert_eq!(&buf[6..8], &[0x12, 0x34]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = Header {
            command: Command::Data,
            length: 0,
        }
        .encode();
        buf[0] = 0x00;
        assert!(matches!(
            Header::decode(&buf),
            Err(ProtoError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut buf = Header {
            command: Command::Data,
            length: 0,
        }
        .encode();
        buf[4] = 0xff;
        buf[5] = 0xfe;
        assert!(matches!(
            Header::decode(&buf),
            Err(ProtoError::UnknownCommand { code: 0xfffe })
        ));
    }
}
