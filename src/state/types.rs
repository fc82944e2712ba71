//! Replica state value types and their wire packing

/// Read/write eligibility of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    Unknown = 0,
    Primary = 1,
    Secondary = 2,
}

impl Role {
    pub fn from_bits(bits: u8) -> Option<Role> {
        match bits {
            0 => Some(Role::Unknown),
            1 => Some(Role::Primary),
            2 => Some(Role::Secondary),
            _ => None,
        }
    }
}

/// Connection progress, ordered. Everything below `Connected` means the
/// peer is unreachable; everything above it is a live link running some
/// flavor of synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    StandAlone = 0,
    Disconnecting = 1,
    Unconnected = 2,
    // network error family
    Timeout = 3,
    BrokenPipe = 4,
    NetworkFailure = 5,
    ProtocolError = 6,
    TearDown = 7,
    // establishing
    Connecting = 8,
    Negotiating = 9,
    Connected = 10,
    StartingSyncSource = 11,
    StartingSyncTarget = 12,
    WaitBitmapSource = 13,
    WaitBitmapTarget = 14,
    WaitSyncUuid = 15,
    SyncSource = 16,
    SyncTarget = 17,
    PausedSyncSource = 18,
    PausedSyncTarget = 19,
    VerifySource = 20,
    VerifyTarget = 21,
}

impl ConnectionState {
    pub fn from_bits(bits: u8) -> Option<ConnectionState> {
        use ConnectionState::*;
        Some(match bits {
            0 => StandAlone,
            1 => Disconnecting,
            2 => Unconnected,
            3 => Timeout,
            4 => BrokenPipe,
            5 => NetworkFailure,
            6 => ProtocolError,
            7 => TearDown,
            8 => Connecting,
            9 => Negotiating,
            10 => Connected,
            11 => StartingSyncSource,
            12 => StartingSyncTarget,
            13 => WaitBitmapSource,
            14 => WaitBitmapTarget,
            15 => WaitSyncUuid,
            16 => SyncSource,
            17 => SyncTarget,
            18 => PausedSyncSource,
            19 => PausedSyncTarget,
            20 => VerifySource,
            21 => VerifyTarget,
            _ => return None,
        })
    }

    /// Timeout through TearDown: states recording why the link died.
    pub fn is_network_error(self) -> bool {
        self >= ConnectionState::Timeout && self <= ConnectionState::TearDown
    }

    /// Any state where a resync or verify is in progress.
    pub fn is_sync_active(self) -> bool {
        self > ConnectionState::Connected
    }
}

/// Disk freshness, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DiskState {
    Diskless = 0,
    Attaching = 1,
    Failed = 2,
    Negotiating = 3,
    Inconsistent = 4,
    Outdated = 5,
    Unknown = 6,
    Consistent = 7,
    UpToDate = 8,
}

impl DiskState {
    pub fn from_bits(bits: u8) -> Option<DiskState> {
        use DiskState::*;
        Some(match bits {
            0 => Diskless,
            1 => Attaching,
            2 => Failed,
            3 => Negotiating,
            4 => Inconsistent,
            5 => Outdated,
            6 => Unknown,
            7 => Consistent,
            8 => UpToDate,
            _ => return None,
        })
    }
}

/// Composite replica state, compared and transitioned atomically.
///
/// All mutation goes through the state machine; nothing outside it
/// assigns fields directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaState {
    pub role: Role,
    pub peer_role: Role,
    pub connection: ConnectionState,
    pub disk: DiskState,
    pub peer_disk: DiskState,
    /// I/O admission frozen
    pub suspended: bool,
    /// Sync paused as a dependency consequence
    pub after_state_paused: bool,
    /// Sync paused by the peer
    pub peer_paused: bool,
    /// Sync paused by the operator
    pub user_paused: bool,
}

impl ReplicaState {
    /// State of a freshly configured, detached, unconnected device.
    pub fn initial() -> Self {
        Self {
            role: Role::Secondary,
            peer_role: Role::Unknown,
            connection: ConnectionState::StandAlone,
            disk: DiskState::Diskless,
            peer_disk: DiskState::Unknown,
            suspended: false,
            after_state_paused: false,
            peer_paused: false,
            user_paused: false,
        }
    }

    /// Any of the three sync-pause flags.
    pub fn any_pause(&self) -> bool {
        self.after_state_paused || self.peer_paused || self.user_paused
    }

    /// Pack for the wire. Layout, low bit first: role 2, peer_role 2,
    /// connection 5, disk 4, peer_disk 4, then one bit each for
    /// suspended / after-state-paused / peer-paused / user-paused.
    pub fn to_wire(&self) -> u32 {
        let mut v = 0u32;
        v |= self.role as u32;
        v |= (self.peer_role as u32) << 2;
        v |= (self.connection as u32) << 4;
        v |= (self.disk as u32) << 9;
        v |= (self.peer_disk as u32) << 13;
        v |= (self.suspended as u32) << 17;
        v |= (self.after_state_paused as u32) << 18;
        v |= (self.peer_paused as u32) << 19;
        v |= (self.user_paused as u32) << 20;
        v
    }

    /// Inverse of [`to_wire`](Self::to_wire). `None` if any field holds
    /// a value outside its enumeration.
    pub fn from_wire(v: u32) -> Option<Self> {
        if v >> 21 != 0 {
            return None;
        }
        Some(Self {
            role: Role::from_bits((v & 0x3) as u8)?,
            peer_role: Role::from_bits(((v >> 2) & 0x3) as u8)?,
            connection: ConnectionState::from_bits(((v >> 4) & 0x1f) as u8)?,
            disk: DiskState::from_bits(((v >> 9) & 0xf) as u8)?,
            peer_disk: DiskState::from_bits(((v >> 13) & 0xf) as u8)?,
            suspended: v & (1 << 17) != 0,
            after_state_paused: v & (1 << 18) != 0,
            peer_paused: v & (1 << 19) != 0,
            user_paused: v & (1 << 20) != 0,
        })
    }
}

/// A partial state overlay: only the fields a caller wants to change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateChange {
    pub role: Option<Role>,
    pub peer_role: Option<Role>,
    pub connection: Option<ConnectionState>,
    pub disk: Option<DiskState>,
    pub peer_disk: Option<DiskState>,
    pub suspended: Option<bool>,
    pub after_state_paused: Option<bool>,
    pub peer_paused: Option<bool>,
    pub user_paused: Option<bool>,
}

impl StateChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn peer_role(mut self, role: Role) -> Self {
        self.peer_role = Some(role);
        self
    }

    pub fn connection(mut self, conn: ConnectionState) -> Self {
        self.connection = Some(conn);
        self
    }

    pub fn disk(mut self, disk: DiskState) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn peer_disk(mut self, disk: DiskState) -> Self {
        self.peer_disk = Some(disk);
        self
    }

    pub fn suspended(mut self, v: bool) -> Self {
        self.suspended = Some(v);
        self
    }

    pub fn user_paused(mut self, v: bool) -> Self {
        self.user_paused = Some(v);
        self
    }

    pub fn peer_paused(mut self, v: bool) -> Self {
        self.peer_paused = Some(v);
        self
    }

    pub fn after_state_paused(mut self, v: bool) -> Self {
        self.after_state_paused = Some(v);
        self
    }

    /// Overlay onto `current`, leaving untouched fields as they are.
    pub fn apply(&self, current: ReplicaState) -> ReplicaState {
        ReplicaState {
            role: self.role.unwrap_or(current.role),
            peer_role: self.peer_role.unwrap_or(current.peer_role),
            connection: self.connection.unwrap_or(current.connection),
            disk: self.disk.unwrap_or(current.disk),
            peer_disk: self.peer_disk.unwrap_or(current.peer_disk),
            suspended: self.suspended.unwrap_or(current.suspended),
            after_state_paused: self
                .after_state_paused
                .unwrap_or(current.after_state_paused),
            peer_paused: self.peer_paused.unwrap_or(current.peer_paused),
            user_paused: self.user_paused.unwrap_or(current.user_paused),
        }
    }

    /// Encode as a mask/value pair using the wire state layout: a
    /// field's mask bits are all set iff the field is present.
    pub fn to_wire(&self) -> (u32, u32) {
        let mut mask = 0u32;
        let mut value = 0u32;
        if let Some(role) = self.role {
            mask |= 0x3;
            value |= role as u32;
        }
        if let Some(role) = self.peer_role {
            mask |= 0x3 << 2;
            value |= (role as u32) << 2;
        }
        if let Some(conn) = self.connection {
            mask |= 0x1f << 4;
            value |= (conn as u32) << 4;
        }
        if let Some(disk) = self.disk {
            mask |= 0xf << 9;
            value |= (disk as u32) << 9;
        }
        if let Some(disk) = self.peer_disk {
            mask |= 0xf << 13;
            value |= (disk as u32) << 13;
        }
        if let Some(v) = self.suspended {
            mask |= 1 << 17;
            value |= (v as u32) << 17;
        }
        if let Some(v) = self.after_state_paused {
            mask |= 1 << 18;
            value |= (v as u32) << 18;
        }
        if let Some(v) = self.peer_paused {
            mask |= 1 << 19;
            value |= (v as u32) << 19;
        }
        if let Some(v) = self.user_paused {
            mask |= 1 << 20;
            value |= (v as u32) << 20;
        }
        (mask, value)
    }

    /// Inverse of [`to_wire`](Self::to_wire). `None` on any field value
    /// outside its enumeration.
    pub fn from_wire(mask: u32, value: u32) -> Option<Self> {
        if mask >> 21 != 0 || value & !mask != 0 {
            return None;
        }
        let mut change = StateChange::new();
        if mask & 0x3 != 0 {
            change.role = Some(Role::from_bits((value & 0x3) as u8)?);
        }
        if mask & (0x3 << 2) != 0 {
            change.peer_role = Some(Role::from_bits(((value >> 2) & 0x3) as u8)?);
        }
        if mask & (0x1f << 4) != 0 {
            change.connection = Some(ConnectionState::from_bits(((value >> 4) & 0x1f) as u8)?);
        }
        if mask & (0xf << 9) != 0 {
            change.disk = Some(DiskState::from_bits(((value >> 9) & 0xf) as u8)?);
        }
        if mask & (0xf << 13) != 0 {
            change.peer_disk = Some(DiskState::from_bits(((value >> 13) & 0xf) as u8)?);
        }
        if mask & (1 << 17) != 0 {
            change.suspended = Some(value & (1 << 17) != 0);
        }
        if mask & (1 << 18) != 0 {
            change.after_state_paused = Some(value & (1 << 18) != 0);
        }
        if mask & (1 << 19) != 0 {
            change.peer_paused = Some(value & (1 << 19) != 0);
        }
        if mask & (1 << 20) != 0 {
            change.user_paused = Some(value & (1 << 20) != 0);
        }
        Some(change)
    }
}
