//! blockmirror: a replicated block-storage engine
//!
//! Keeps a local block device and a peer's copy of it in sync over a
//! point-to-point link. Writes replicate through an epoch-ordered
//! transfer log; divergence while the peer is unreachable is tracked
//! in a per-block dirty bitmap; on reconnect the generation UUID
//! chains decide whether a bitmap-driven partial resync or a full one
//! is needed. A shared-nothing state machine guards every role,
//! connection and disk transition on both sides.
//!
//! The crate is transport-agnostic: [`transport::Transport`] is the
//! only seam to the outside, and [`device::ReplicaDevice`] is a pure
//! step machine the embedding layer pumps with packets and timer
//! ticks.

pub mod bitmap;
pub mod clock;
pub mod device;
pub mod meta;
pub mod observability;
pub mod proto;
pub mod registry;
pub mod resync;
pub mod state;
pub mod storage;
pub mod tlog;
pub mod transport;

pub use device::{DeviceConfig, ReplicaDevice};
pub use registry::DeviceRegistry;
