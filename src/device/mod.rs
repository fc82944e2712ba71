//! The replicated device
//!
//! Glue layer that owns one device's state machine, transfer log,
//! bitmap, metadata and resync coordinator, and turns packets and
//! application I/O into coordinated mutations of all of them.

mod config;
mod device;
mod errors;
mod notify;
mod worker;

pub use config::{ConfigError, DeviceConfig, DigestKind, DurabilityMode, LostWritePolicy};
pub use device::{ReplicaDevice, WriteCompletion, WriteOutcome};
pub use errors::{DeviceError, DeviceResult};
pub use notify::Notifier;
pub use worker::{DeferredWork, WorkQueue};
