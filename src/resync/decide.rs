//! Deciding whether and how to resynchronize on reconnect
//!
//! Purely a comparison of the two generation UUID chains plus the
//! flags both sides exchanged. The outcome says who sends data to
//! whom and whether the dirty bitmap is sufficient or the whole
//! device must travel.

use crate::meta::{
    uuid_key, UuidSet, HISTORY_SLOTS, UUID_FLAG_CRASHED_PRIMARY, UUID_FLAG_DISCARD_LOCAL,
    UUID_FLAG_INCONSISTENT, UUID_FLAG_SKIP_INITIAL_SYNC,
};

/// Which end of the link sends data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// The local replica sends.
    Source,
    /// The local replica receives.
    Target,
}

/// Outcome of comparing generation chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Same generation on both sides, nothing to do.
    NoSync,
    /// The dirty bitmap covers the divergence.
    Partial(SyncDirection),
    /// The whole device must be copied.
    Full(SyncDirection),
    /// Neither chain recognizes the other; an operator must pick a
    /// survivor, automatic sync would destroy data.
    Unrelated,
}

/// The peer's chain as received in a UUID packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerUuids {
    pub current: u64,
    pub bitmap: u64,
    pub history: [u64; HISTORY_SLOTS],
    pub flags: u32,
}

impl PeerUuids {
    fn history_contains(&self, candidate: u64) -> bool {
        self.history
            .iter()
            .any(|&h| h != 0 && uuid_key(h) == uuid_key(candidate))
    }
}

/// Compare the local chain against the peer's.
pub fn decide(local: &UuidSet, local_flags: u32, peer: &PeerUuids) -> SyncDecision {
    use SyncDecision::*;
    use SyncDirection::*;

    // an operator-requested discard overrides every comparison
    if local_flags & UUID_FLAG_DISCARD_LOCAL != 0 {
        return Full(Target);
    }
    if peer.flags & UUID_FLAG_DISCARD_LOCAL != 0 {
        return Full(Source);
    }

    let local_current = uuid_key(local.current);
    let peer_current = uuid_key(peer.current);

    // two freshly created devices
    if local_current == 0 && peer_current == 0 {
        if (local_flags | peer.flags) & UUID_FLAG_SKIP_INITIAL_SYNC != 0 {
            return NoSync;
        }
        return Full(Source);
    }

    if local_current == peer_current {
        let local_crashed = local_flags & UUID_FLAG_CRASHED_PRIMARY != 0;
        let peer_crashed = peer.flags & UUID_FLAG_CRASHED_PRIMARY != 0;
        return match (local_crashed, peer_crashed) {
            (false, false) => NoSync,
            // a crashed primary may hold writes the peer never saw;
            // its bitmap knows which
            (true, _) => Partial(Source),
            (false, true) => Partial(Target),
        };
    }

    // our bitmap has tracked every change since the peer's generation
    if uuid_key(local.bitmap) == peer_current || local.history_contains(peer_current) {
        return Partial(Source);
    }
    // mirror image: the peer diverged from our generation
    if uuid_key(peer.bitmap) == local_current || peer.history_contains(local_current) {
        return Partial(Target);
    }

    // unrelated chains: only an inconsistent side may be overwritten
    let local_inconsistent = local_flags & UUID_FLAG_INCONSISTENT != 0;
    let peer_inconsistent = peer.flags & UUID_FLAG_INCONSISTENT != 0;
    match (local_inconsistent, peer_inconsistent) {
        (true, false) => Full(Target),
        (false, true) => Full(Source),
        _ => Unrelated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(current: u64, bitmap: u64, history: [u64; 2]) -> UuidSet {
        UuidSet {
            current,
            bitmap,
            history,
        }
    }

    #[test]
    fn test_equal_currents_need_no_sync() {
        let l = local(0x1000, 0, [0, 0]);
        let p = PeerUuids {
            current: 0x1001, // primary marker differs, key equal
            ..Default::default()
        };
        assert_eq!(decide(&l, 0, &p), SyncDecision::NoSync);
    }

    #[test]
    fn test_crashed_primary_forces_partial() {
        let l = local(0x1000, 0, [0, 0]);
        let p = PeerUuids {
            current: 0x1000,
            ..Default::default()
        };
        assert_eq!(
            decide(&l, UUID_FLAG_CRASHED_PRIMARY, &p),
            SyncDecision::Partial(SyncDirection::Source)
        );
        let p_crashed = PeerUuids {
            current: 0x1000,
            flags: UUID_FLAG_CRASHED_PRIMARY,
            ..Default::default()
        };
        assert_eq!(
            decide(&l, 0, &p_crashed),
            SyncDecision::Partial(SyncDirection::Target)
        );
    }

    #[test]
    fn test_bitmap_match_means_partial_source() {
        // we promoted while disconnected: bitmap slot still holds the
        // generation the peer sits on
        let l = local(0x2000, 0x1000, [0, 0]);
        let p = PeerUuids {
            current: 0x1000,
            ..Default::default()
        };
        assert_eq!(
            decide(&l, 0, &p),
            SyncDecision::Partial(SyncDirection::Source)
        );
    }

    #[test]
    fn test_peer_bitmap_match_means_partial_target() {
        let l = local(0x1000, 0, [0, 0]);
        let p = PeerUuids {
            current: 0x2000,
            bitmap: 0x1000,
            ..Default::default()
        };
        assert_eq!(
            decide(&l, 0, &p),
            SyncDecision::Partial(SyncDirection::Target)
        );
    }

    #[test]
    fn test_history_match_means_partial() {
        let l = local(0x3000, 0x2000, [0x1000, 0]);
        let p = PeerUuids {
            current: 0x1000,
            ..Default::default()
        };
        assert_eq!(
            decide(&l, 0, &p),
            SyncDecision::Partial(SyncDirection::Source)
        );
    }

    #[test]
    fn test_unrelated_generations_refused_when_both_clean() {
        let l = local(0x1000, 0, [0, 0]);
        let p = PeerUuids {
            current: 0x9000,
            ..Default::default()
        };
        assert_eq!(decide(&l, 0, &p), SyncDecision::Unrelated);
    }

    #[test]
    fn test_inconsistent_side_becomes_full_target() {
        let l = local(0x1000, 0, [0, 0]);
        let p = PeerUuids {
            current: 0x9000,
            ..Default::default()
        };
        assert_eq!(
            decide(&l, UUID_FLAG_INCONSISTENT, &p),
            SyncDecision::Full(SyncDirection::Target)
        );
        let p_inconsistent = PeerUuids {
            current: 0x9000,
            flags: UUID_FLAG_INCONSISTENT,
            ..Default::default()
        };
        assert_eq!(
            decide(&l, 0, &p_inconsistent),
            SyncDecision::Full(SyncDirection::Source)
        );
    }

    #[test]
    fn test_discard_local_overrides_everything() {
        let l = local(0x1000, 0, [0, 0]);
        let p = PeerUuids {
            current: 0x1000,
            ..Default::default()
        };
        assert_eq!(
            decide(&l, UUID_FLAG_DISCARD_LOCAL, &p),
            SyncDecision::Full(SyncDirection::Target)
        );
    }

    #[test]
    fn test_fresh_devices() {
        let l = local(0, 0, [0, 0]);
        let p = PeerUuids::default();
        assert_eq!(
            decide(&l, 0, &p),
            SyncDecision::Full(SyncDirection::Source)
        );
        assert_eq!(
            decide(&l, UUID_FLAG_SKIP_INITIAL_SYNC, &p),
            SyncDecision::NoSync
        );
    }
}
