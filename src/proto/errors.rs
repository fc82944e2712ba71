//! Protocol error types
//!
//! Anything the peer sends that fails to parse is fatal to the
//! connection. Transport-level failures are not protocol violations;
//! they mean the link is gone and drive the reconnect path instead.

use thiserror::Error;

/// Result type for protocol operations
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Protocol codec and session errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Header carried the wrong magic constant
    #[error("bad packet magic {found:#010x}")]
    BadMagic {
        /// Magic found on the wire
        found: u32,
    },

    /// Header named a command this build does not know
    #[error("unknown command code {code:#06x}")]
    UnknownCommand {
        /// Received command code
        code: u16,
    },

    /// Payload did not parse for its command
    #[error("malformed {command} payload: {reason}")]
    MalformedPacket {
        /// Command whose payload failed
        command: &'static str,
        /// What was wrong
        reason: &'static str,
    },

    /// Write payload failed its integrity digest
    #[error("digest mismatch on replicated write at sector {sector}")]
    DigestMismatch {
        /// Sector of the offending write
        sector: u64,
    },

    /// No packet arrived within the configured window
    #[error("receive timed out")]
    Timeout,

    /// The peer closed the stream
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Transport-level failure
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// True for peer misbehavior that must poison the connection with a
    /// protocol-error state; false for link loss, which takes the
    /// ordinary disconnect path.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtoError::BadMagic { .. }
                | ProtoError::UnknownCommand { .. }
                | ProtoError::MalformedPacket { .. }
                | ProtoError::DigestMismatch { .. }
        )
    }
}
