//! Command payload codecs
//!
//! Every payload is fixed-layout big-endian fields, with the two
//! variable tails (write data, bitmap runs) running to the end of the
//! frame. The write payload optionally carries a trailing digest whose
//! length is negotiated per session and therefore passed into the
//! codec rather than framed.

use super::errors::{ProtoError, ProtoResult};
use super::header::{Command, Header, HEADER_LEN, MAX_PAYLOAD};
use crate::resync::PeerUuids;
use crate::state::{ReplicaState, StateChange};

/// Write flag: the target may clear the block's dirty bit once the
/// write is durable (resync data rather than foreground replication).
pub const WRITE_FLAG_MARK_IN_SYNC: u32 = 1;

/// A replicated write in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePacket {
    pub sector: u64,
    pub correlation_id: u64,
    pub flags: u32,
    pub payload: Vec<u8>,
    /// Trailing integrity digest, present iff negotiated.
    pub digest: Option<Vec<u8>>,
}

/// One decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(WritePacket),
    DataAck {
        sector: u64,
        correlation_id: u64,
        length: u32,
    },
    Barrier {
        barrier_number: u32,
    },
    BarrierAck {
        barrier_number: u32,
        expected_count: u32,
    },
    StateBroadcast {
        state: ReplicaState,
    },
    StateChangeRequest {
        change: StateChange,
    },
    StateChangeReply {
        code: i32,
    },
    UuidSet {
        uuids: PeerUuids,
    },
    Sizes {
        device_sectors: u64,
        size_limit_sectors: u64,
        max_segment_bytes: u32,
        queue_order: u32,
    },
    BitmapCompressed {
        start_is_set: bool,
        runs: Vec<u8>,
    },
    BitmapPlain {
        word_offset: u32,
        words: Vec<u64>,
    },
    SyncUuid {
        uuid: u64,
    },
}

impl Packet {
    pub fn command(&self) -> Command {
        match self {
            Packet::Data(_) => Command::Data,
            Packet::DataAck { .. } => Command::DataAck,
            Packet::Barrier { .. } => Command::Barrier,
            Packet::BarrierAck { .. } => Command::BarrierAck,
            Packet::StateBroadcast { .. } => Command::StateBroadcast,
            Packet::StateChangeRequest { .. } => Command::StateChangeRequest,
            Packet::StateChangeReply { .. } => Command::StateChangeReply,
            Packet::UuidSet { .. } => Command::UuidSet,
            Packet::Sizes { .. } => Command::Sizes,
            Packet::BitmapCompressed { .. } => Command::BitmapCompressed,
            Packet::BitmapPlain { .. } => Command::BitmapPlain,
            Packet::SyncUuid { .. } => Command::SyncUuid,
        }
    }

    /// Encode header and payload into one frame. `digest_len` is the
    /// negotiated digest size; a write packet must carry exactly that
    /// much digest.
    pub fn encode(&self, digest_len: usize) -> ProtoResult<Vec<u8>> {
        let mut payload = Vec::new();
        match self {
            Packet::Data(w) => {
                let carried = w.digest.as_ref().map(Vec::len).unwrap_or(0);
                if carried != digest_len {
                    return Err(malformed("Data", "digest length disagrees with negotiation"));
                }
                payload.extend_from_slice(&w.sector.to_be_bytes());
                payload.extend_from_slice(&w.correlation_id.to_be_bytes());
                payload.extend_from_slice(&(w.payload.len() as u32).to_be_bytes());
                payload.extend_from_slice(&w.flags.to_be_bytes());
                payload.extend_from_slice(&w.payload);
                if let Some(digest) = &w.digest {
                    payload.extend_from_slice(digest);
                }
            }
            Packet::DataAck {
                sector,
                correlation_id,
                length,
            } => {
                payload.extend_from_slice(&sector.to_be_bytes());
                payload.extend_from_slice(&correlation_id.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Packet::Barrier { barrier_number } => {
                payload.extend_from_slice(&barrier_number.to_be_bytes());
            }
            Packet::BarrierAck {
                barrier_number,
                expected_count,
            } => {
                payload.extend_from_slice(&barrier_number.to_be_bytes());
                payload.extend_from_slice(&expected_count.to_be_bytes());
            }
            Packet::StateBroadcast { state } => {
                payload.extend_from_slice(&state.to_wire().to_be_bytes());
            }
            Packet::StateChangeRequest { change } => {
                let (mask, value) = change.to_wire();
                payload.extend_from_slice(&mask.to_be_bytes());
                payload.extend_from_slice(&value.to_be_bytes());
            }
            Packet::StateChangeReply { code } => {
                payload.extend_from_slice(&code.to_be_bytes());
            }
            Packet::UuidSet { uuids } => {
                payload.extend_from_slice(&uuids.current.to_be_bytes());
                payload.extend_from_slice(&uuids.bitmap.to_be_bytes());
                payload.extend_from_slice(&uuids.history[0].to_be_bytes());
                payload.extend_from_slice(&uuids.history[1].to_be_bytes());
                payload.extend_from_slice(&uuids.flags.to_be_bytes());
            }
            Packet::Sizes {
                device_sectors,
                size_limit_sectors,
                max_segment_bytes,
                queue_order,
            } => {
                payload.extend_from_slice(&device_sectors.to_be_bytes());
                payload.extend_from_slice(&size_limit_sectors.to_be_bytes());
                payload.extend_from_slice(&max_segment_bytes.to_be_bytes());
                payload.extend_from_slice(&queue_order.to_be_bytes());
            }
            Packet::BitmapCompressed { start_is_set, runs } => {
                payload.push(u8::from(*start_is_set));
                payload.extend_from_slice(runs);
            }
            Packet::BitmapPlain { word_offset, words } => {
                payload.extend_from_slice(&word_offset.to_be_bytes());
                for word in words {
                    payload.extend_from_slice(&word.to_be_bytes());
                }
            }
            Packet::SyncUuid { uuid } => {
                payload.extend_from_slice(&uuid.to_be_bytes());
            }
        }

        if payload.len() > MAX_PAYLOAD {
            return Err(malformed(self.command().name(), "payload exceeds frame limit"));
        }
        let header = Header {
            command: self.command(),
            length: payload.len() as u16,
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode one payload for `command`.
    pub fn decode(command: Command, payload: &[u8], digest_len: usize) -> ProtoResult<Packet> {
        let mut buf = payload;
        let packet = match command {
            Command::Data => {
                let sector = take_u64(&mut buf).ok_or_else(|| truncated(command))?;
                let correlation_id = take_u64(&mut buf).ok_or_else(|| truncated(command))?;
                let length = take_u32(&mut buf).ok_or_else(|| truncated(command))? as usize;
                let flags = take_u32(&mut buf).ok_or_else(|| truncated(command))?;
                if buf.len() != length + digest_len {
                    return Err(malformed("Data", "length field disagrees with frame"));
                }
                let data = buf[..length].to_vec();
                let digest = if digest_len > 0 {
                    Some(buf[length..].to_vec())
                } else {
                    None
                };
                buf = &[];
                Packet::Data(WritePacket {
                    sector,
                    correlation_id,
                    flags,
                    payload: data,
                    digest,
                })
            }
            Command::DataAck => Packet::DataAck {
                sector: take_u64(&mut buf).ok_or_else(|| truncated(command))?,
                correlation_id: take_u64(&mut buf).ok_or_else(|| truncated(command))?,
                length: take_u32(&mut buf).ok_or_else(|| truncated(command))?,
            },
            Command::Barrier => Packet::Barrier {
                barrier_number: take_u32(&mut buf).ok_or_else(|| truncated(command))?,
            },
            Command::BarrierAck => Packet::BarrierAck {
                barrier_number: take_u32(&mut buf).ok_or_else(|| truncated(command))?,
                expected_count: take_u32(&mut buf).ok_or_else(|| truncated(command))?,
            },
            Command::StateBroadcast => {
                let packed = take_u32(&mut buf).ok_or_else(|| truncated(command))?;
                let state = ReplicaState::from_wire(packed)
                    .ok_or_else(|| malformed("StateBroadcast", "field outside enumeration"))?;
                Packet::StateBroadcast { state }
            }
            Command::StateChangeRequest => {
                let mask = take_u32(&mut buf).ok_or_else(|| truncated(command))?;
                let value = take_u32(&mut buf).ok_or_else(|| truncated(command))?;
                let change = StateChange::from_wire(mask, value)
                    .ok_or_else(|| malformed("StateChangeRequest", "field outside enumeration"))?;
                Packet::StateChangeRequest { change }
            }
            Command::StateChangeReply => Packet::StateChangeReply {
                code: take_u32(&mut buf).ok_or_else(|| truncated(command))? as i32,
            },
            Command::UuidSet => Packet::UuidSet {
                uuids: PeerUuids {
                    current: take_u64(&mut buf).ok_or_else(|| truncated(command))?,
                    bitmap: take_u64(&mut buf).ok_or_else(|| truncated(command))?,
                    history: [
                        take_u64(&mut buf).ok_or_else(|| truncated(command))?,
                        take_u64(&mut buf).ok_or_else(|| truncated(command))?,
                    ],
                    flags: take_u32(&mut buf).ok_or_else(|| truncated(command))?,
                },
            },
            Command::Sizes => Packet::Sizes {
                device_sectors: take_u64(&mut buf).ok_or_else(|| truncated(command))?,
                size_limit_sectors: take_u64(&mut buf).ok_or_else(|| truncated(command))?,
                max_segment_bytes: take_u32(&mut buf).ok_or_else(|| truncated(command))?,
                queue_order: take_u32(&mut buf).ok_or_else(|| truncated(command))?,
            },
            Command::BitmapCompressed => {
                let head = take_u8(&mut buf).ok_or_else(|| truncated(command))?;
                if head > 1 {
                    return Err(malformed("BitmapCompressed", "reserved flag bits set"));
                }
                let runs = buf.to_vec();
                buf = &[];
                Packet::BitmapCompressed {
                    start_is_set: head == 1,
                    runs,
                }
            }
            Command::BitmapPlain => {
                let word_offset = take_u32(&mut buf).ok_or_else(|| truncated(command))?;
                if buf.len() % 8 != 0 {
                    return Err(malformed("BitmapPlain", "word payload not a multiple of 8"));
                }
                let mut words = Vec::with_capacity(buf.len() / 8);
                while let Some(word) = take_u64(&mut buf) {
                    words.push(word);
                }
                Packet::BitmapPlain { word_offset, words }
            }
            Command::SyncUuid => Packet::SyncUuid {
                uuid: take_u64(&mut buf).ok_or_else(|| truncated(command))?,
            },
        };
        if !buf.is_empty() {
            return Err(malformed(command.name(), "trailing bytes after payload"));
        }
        Ok(packet)
    }
}

fn malformed(command: &'static str, reason: &'static str) -> ProtoError {
    ProtoError::MalformedPacket { command, reason }
}

fn truncated(command: Command) -> ProtoError {
    ProtoError::MalformedPacket {
        command: command.name(),
        reason: "truncated payload",
    }
}

fn take_u8(buf: &mut &[u8]) -> Option<u8> {
    let (&first, rest) = buf.split_first()?;
    *buf = rest;
    Some(first)
}

fn take_u32(buf: &mut &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let (head, rest) = buf.split_at(4);
    *buf = rest;
    Some(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

fn take_u64(buf: &mut &[u8]) -> Option<u64> {
    if buf.len() < 8 {
        return None;
    }
    let (head, rest) = buf.split_at(8);
    *buf = rest;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(head);
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConnectionState, Role};

    fn roundtrip(packet: Packet, digest_len: usize) -> Packet {
        let frame = packet.encode(digest_len).unwrap();
        let header = Header::decode(frame[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(header.command, packet.command());
        assert_eq!(header.length as usize, frame.len() - HEADER_LEN);
        Packet::decode(header.command, &frame[HEADER_LEN..], digest_len).unwrap()
    }

    #[test]
    fn test_barrier_ack_roundtrip() {
        let packet = Packet::BarrierAck {
            barrier_number: 4711,
            expected_count: 3,
        };
        assert_eq!(roundtrip(packet.clone(), 0), packet);
    }

    #[test]
    fn test_write_roundtrip_with_digest() {
        let packet = Packet::Data(WritePacket {
            sector: 2048,
            correlation_id: 99,
            flags: WRITE_FLAG_MARK_IN_SYNC,
            payload: vec![0xab; 4096],
            digest: Some(vec![1, 2, 3, 4]),
        });
        assert_eq!(roundtrip(packet.clone(), 4), packet);
    }

    #[test]
    fn test_write_digest_negotiation_enforced() {
        let packet = Packet::Data(WritePacket {
            sector: 0,
            correlation_id: 1,
            flags: 0,
            payload: vec![0; 512],
            digest: None,
        });
        assert!(packet.encode(4).is_err(), "missing negotiated digest");
        assert!(packet.encode(0).is_ok());
    }

    #[test]
    fn test_write_length_field_must_match_frame() {
        let packet = Packet::Data(WritePacket {
            sector: 0,
            correlation_id: 1,
            flags: 0,
            payload: vec![7; 512],
            digest: None,
        });
        let frame = packet.encode(0).unwrap();
        // claim a shorter write than the frame carries
        let mut frame = frame;
        frame[HEADER_LEN + 16..HEADER_LEN + 20].copy_from_slice(&100u32.to_be_bytes());
        let err = Packet::decode(Command::Data, &frame[HEADER_LEN..], 0).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_state_broadcast_roundtrip() {
        let mut state = ReplicaState::initial();
        state.role = Role::Primary;
        state.connection = ConnectionState::Connected;
        let packet = Packet::StateBroadcast { state };
        assert_eq!(roundtrip(packet.clone(), 0), packet);
    }

    #[test]
    fn test_state_change_request_roundtrip() {
        let change = StateChange::new()
            .role(Role::Primary)
            .connection(ConnectionState::Connected);
        let packet = Packet::StateChangeRequest { change };
        assert_eq!(roundtrip(packet.clone(), 0), packet);
    }

    #[test]
    fn test_negative_reply_code_survives_the_wire() {
        let packet = Packet::StateChangeReply { code: -7 };
        assert_eq!(roundtrip(packet.clone(), 0), packet);
    }

    #[test]
    fn test_uuid_set_roundtrip() {
        let packet = Packet::UuidSet {
            uuids: PeerUuids {
                current: 0x1111,
                bitmap: 0x2222,
                history: [0x3333, 0x4444],
                flags: 0x2,
            },
        };
        assert_eq!(roundtrip(packet.clone(), 0), packet);
    }

    #[test]
    fn test_bitmap_packets_roundtrip() {
        let compressed = Packet::BitmapCompressed {
            start_is_set: true,
            runs: vec![0x85, 0x01, 0x7f],
        };
        assert_eq!(roundtrip(compressed.clone(), 0), compressed);

        let plain = Packet::BitmapPlain {
            word_offset: 12,
            words: vec![u64::MAX, 0, 0xaaaa_5555_aaaa_5555],
        };
        assert_eq!(roundtrip(plain.clone(), 0), plain);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let err = Packet::decode(Command::BarrierAck, &[0, 0, 0x12], 0).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let frame = Packet::Barrier { barrier_number: 1 }.encode(0).unwrap();
        let mut payload = frame[HEADER_LEN..].to_vec();
        payload.push(0);
        let err = Packet::decode(Command::Barrier, &payload, 0).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_invalid_state_bits_rejected() {
        // connection field holds 31
        let payload = (0x1fu32 << 4).to_be_bytes();
        let err = Packet::decode(Command::StateBroadcast, &payload, 0).unwrap_err();
        assert!(err.is_protocol_violation());
    }
}
