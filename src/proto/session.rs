//! Framed packet session over a transport
//!
//! Owns one side of an established connection: frames packets onto the
//! byte stream, reassembles and validates incoming frames, and applies
//! the negotiated integrity digest to replicated write payloads. The
//! session does not interpret packets; the device layer does.

use super::errors::{ProtoError, ProtoResult};
use super::header::{Header, HEADER_LEN};
use super::packets::Packet;
use crate::storage::Digest;
use crate::transport::Transport;
use std::io;
use std::time::Duration;

pub struct Session<T: Transport> {
    transport: T,
    digest: Option<Box<dyn Digest>>,
    recv_timeout: Duration,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, recv_timeout: Duration) -> Self {
        Self {
            transport,
            digest: None,
            recv_timeout,
        }
    }

    /// Enable write-payload integrity checking. Both sides must agree
    /// on the algorithm; the wire only carries the raw digest bytes.
    pub fn with_digest(mut self, digest: Box<dyn Digest>) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn digest_len(&self) -> usize {
        self.digest.as_ref().map(|d| d.digest_len()).unwrap_or(0)
    }

    /// Frame and send one packet. A write packet gets its digest
    /// computed here if negotiated and not already attached.
    pub fn send(&mut self, packet: &Packet) -> ProtoResult<()> {
        let frame = match (packet, &self.digest) {
            (Packet::Data(w), Some(digest)) if w.digest.is_none() => {
                let mut signed = w.clone();
                signed.digest = Some(digest.compute(&signed.payload));
                Packet::Data(signed).encode(self.digest_len())?
            }
            _ => packet.encode(self.digest_len())?,
        };
        self.transport.send(&frame)?;
        Ok(())
    }

    /// Receive one packet, waiting at most the configured timeout for
    /// each read. Digest verification failures surface as protocol
    /// violations, not I/O errors.
    pub fn recv(&mut self) -> ProtoResult<Packet> {
        let mut header_buf = [0u8; HEADER_LEN];
        self.transport
            .recv_exact(&mut header_buf, self.recv_timeout)
            .map_err(map_io)?;
        let header = Header::decode(&header_buf)?;

        let mut payload = vec![0u8; header.length as usize];
        self.transport
            .recv_exact(&mut payload, self.recv_timeout)
            .map_err(map_io)?;
        let packet = Packet::decode(header.command, &payload, self.digest_len())?;

        if let (Packet::Data(w), Some(digest)) = (&packet, &self.digest) {
            let carried = w.digest.as_deref().unwrap_or(&[]);
            if !digest.verify(&w.payload, carried) {
                return Err(ProtoError::DigestMismatch { sector: w.sector });
            }
        }
        Ok(packet)
    }

    /// Tear the connection down. The transport is unusable afterwards.
    pub fn shutdown(&mut self) {
        self.transport.shutdown();
    }
}

fn map_io(err: io::Error) -> ProtoError {
    match err.kind() {
        io::ErrorKind::TimedOut => ProtoError::Timeout,
        io::ErrorKind::UnexpectedEof => ProtoError::ConnectionClosed,
        _ => ProtoError::Io(err),
    }
}
