//! Process-wide device registry
//!
//! Devices are addressed by their minor number. The registry owns
//! them; everything else borrows a device for the duration of one
//! operation.

use crate::device::ReplicaDevice;
use crate::observability::{emit, Event};
use std::collections::BTreeMap;
use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("minor {0} is already registered")]
    DuplicateMinor(u32),
    #[error("no device registered under minor {0}")]
    UnknownMinor(u32),
}

/// All configured devices of this process.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, ReplicaDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its configured minor number.
    pub fn register(&mut self, device: ReplicaDevice) -> RegistryResult<()> {
        let minor = device.config().minor;
        if self.devices.contains_key(&minor) {
            return Err(RegistryError::DuplicateMinor(minor));
        }
        self.devices.insert(minor, device);
        emit(Event::DeviceRegistered, &[("minor", &minor.to_string())]);
        Ok(())
    }

    pub fn get(&self, minor: u32) -> RegistryResult<&ReplicaDevice> {
        self.devices
            .get(&minor)
            .ok_or(RegistryError::UnknownMinor(minor))
    }

    pub fn get_mut(&mut self, minor: u32) -> RegistryResult<&mut ReplicaDevice> {
        self.devices
            .get_mut(&minor)
            .ok_or(RegistryError::UnknownMinor(minor))
    }

    /// Remove and return a device, ending its registration.
    pub fn remove(&mut self, minor: u32) -> RegistryResult<ReplicaDevice> {
        let device = self
            .devices
            .remove(&minor)
            .ok_or(RegistryError::UnknownMinor(minor))?;
        emit(Event::DeviceRemoved, &[("minor", &minor.to_string())]);
        Ok(device)
    }

    /// Registered minor numbers, ascending.
    pub fn minors(&self) -> Vec<u32> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
