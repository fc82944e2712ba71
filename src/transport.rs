//! Reliable byte-stream transport seam
//!
//! The engine treats the network as an ordered byte stream that can
//! fail and be replaced. Socket setup, TLS, and reconnect backoff all
//! live outside this crate; [`Transport`] is the only surface the
//! protocol session sees.
//!
//! [`MemoryTransport`] provides a loopback pair so two devices can be
//! wired together inside one process, which is how the integration
//! suites exercise the full protocol.

use std::io;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

/// An ordered, reliable byte stream with explicit disconnect reporting.
///
/// All errors are terminal for the connection: the session maps any
/// transport error to connection loss, after which the transport object
/// is discarded and a new one must be supplied to reconnect.
pub trait Transport: Send {
    /// Send all of `data`, preserving ordering with prior sends.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receive exactly `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// A timeout is reported as [`io::ErrorKind::TimedOut`]; a closed
    /// peer as [`io::ErrorKind::UnexpectedEof`].
    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()>;

    /// Shut the stream down. Further operations fail.
    fn shutdown(&mut self);
}

/// One end of an in-process loopback connection.
pub struct MemoryTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    /// Bytes received but not yet consumed by `recv_exact`.
    pending: Vec<u8>,
    closed: bool,
    /// Shared kill switch: shutting down either end breaks both.
    broken: std::sync::Arc<Mutex<bool>>,
}

impl MemoryTransport {
    /// Create a connected pair of transports.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = channel();
        let (b_tx, b_rx) = channel();
        let broken = std::sync::Arc::new(Mutex::new(false));
        let a = MemoryTransport {
            tx: a_tx,
            rx: b_rx,
            pending: Vec::new(),
            closed: false,
            broken: broken.clone(),
        };
        let b = MemoryTransport {
            tx: b_tx,
            rx: a_rx,
            pending: Vec::new(),
            closed: false,
            broken,
        };
        (a, b)
    }

    fn is_broken(&self) -> bool {
        self.closed || *self.broken.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if self.is_broken() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }

    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
        if self.is_broken() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        let deadline = std::time::Instant::now() + timeout;
        while self.pending.len() < buf.len() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "recv timeout"));
            }
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "recv timeout"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"))
                }
            }
        }
        buf.copy_from_slice(&self.pending[..buf.len()]);
        self.pending.drain(..buf.len());
        Ok(())
    }

    fn shutdown(&mut self) {
        self.closed = true;
        if let Ok(mut broken) = self.broken.lock() {
            *broken = true;
        }
    }
}
