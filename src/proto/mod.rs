//! Wire protocol
//!
//! Fixed eight-byte header (magic, command, payload length), big-endian
//! command payloads, and a session that frames packets over the
//! transport seam with optional write-payload integrity digests.

mod errors;
mod header;
mod packets;
mod session;

pub use errors::{ProtoError, ProtoResult};
pub use header::{Command, Header, HEADER_LEN, MAX_PAYLOAD, WIRE_MAGIC};
pub use packets::{Packet, WritePacket, WRITE_FLAG_MARK_IN_SYNC};
pub use session::Session;
