//! Data-generation UUID chains
//!
//! Each replica tags its data generation with a 64-bit value. The
//! current value changes when the data starts diverging (promotion
//! while disconnected, start of a resync); the previous current value
//! moves into the bitmap slot and, later, the history ring. Comparing
//! the two chains on reconnect tells both sides whether they need no
//! sync, a bitmap-driven partial sync, or a full one.
//!
//! The lowest bit of the current value flags "generated while
//! Primary"; it is masked out whenever values are compared.

use rand::Rng;

/// History ring depth.
pub const HISTORY_SLOTS: usize = 2;

/// Flag bits carried alongside a UUID set on the wire.
pub const UUID_FLAG_DISCARD_LOCAL: u32 = 1;
pub const UUID_FLAG_CRASHED_PRIMARY: u32 = 2;
pub const UUID_FLAG_INCONSISTENT: u32 = 4;
pub const UUID_FLAG_SKIP_INITIAL_SYNC: u32 = 8;

/// Strip the Primary marker bit for comparisons.
pub fn uuid_key(uuid: u64) -> u64 {
    uuid & !1
}

/// The local replica's generation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UuidSet {
    pub current: u64,
    pub bitmap: u64,
    pub history: [u64; HISTORY_SLOTS],
}

impl UuidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a brand-new current value, demoting the old one into
    /// the bitmap slot. `while_primary` sets the marker bit.
    pub fn new_current<R: Rng>(&mut self, rng: &mut R, while_primary: bool) {
        if self.bitmap != 0 {
            self.push_bitmap_to_history();
        }
        self.bitmap = self.current;
        let mut fresh: u64 = rng.gen();
        fresh &= !1;
        if fresh == 0 {
            fresh = 2;
        }
        if while_primary {
            fresh |= 1;
        }
        self.current = fresh;
    }

    /// Record the start of divergence tracking: the bitmap slot takes
    /// the current value so the peer can later recognize what our
    /// bitmap was relative to.
    pub fn set_bitmap_from_current(&mut self) {
        if self.bitmap != 0 {
            self.push_bitmap_to_history();
        }
        self.bitmap = self.current;
    }

    /// A completed resync retires the bitmap value into history.
    pub fn rotate_after_resync(&mut self) {
        if self.bitmap != 0 {
            self.push_bitmap_to_history();
            self.bitmap = 0;
        }
    }

    /// Adopt the sync source's current value as our own; the target
    /// ends a resync carrying the source's generation.
    pub fn adopt_current(&mut self, source_current: u64) {
        self.current = uuid_key(source_current);
    }

    /// True if `candidate` matches any history slot.
    pub fn history_contains(&self, candidate: u64) -> bool {
        self.history
            .iter()
            .any(|&h| h != 0 && uuid_key(h) == uuid_key(candidate))
    }

    fn push_bitmap_to_history(&mut self) {
        for i in (1..HISTORY_SLOTS).rev() {
            self.history[i] = self.history[i - 1];
        }
        self.history[0] = self.bitmap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_new_current_demotes_old_value() {
        let mut uuids = UuidSet::new();
        uuids.current = 0x1000;
        let mut rng = StepRng::new(0xaaaa_0000, 1);
        uuids.new_current(&mut rng, true);
        assert_eq!(uuids.bitmap, 0x1000);
        assert_ne!(uuid_key(uuids.current), 0x1000);
        assert_eq!(uuids.current & 1, 1, "primary marker bit set");
    }

    #[test]
    fn test_new_current_preserves_existing_bitmap_in_history() {
        let mut uuids = UuidSet::new();
        uuids.current = 0x3000;
        uuids.bitmap = 0x2000;
        uuids.history = [0x1000, 0];
        let mut rng = StepRng::new(7, 1);
        uuids.new_current(&mut rng, false);
        assert_eq!(uuids.bitmap, 0x3000);
        assert_eq!(uuids.history, [0x2000, 0x1000]);
        assert_eq!(uuids.current & 1, 0);
    }

    #[test]
    fn test_rotate_after_resync() {
        let mut uuids = UuidSet::new();
        uuids.current = 0x3000;
        uuids.bitmap = 0x2000;
        uuids.rotate_after_resync();
        assert_eq!(uuids.bitmap, 0);
        assert_eq!(uuids.history[0], 0x2000);

        // rotating with an empty bitmap slot changes nothing
        let before = uuids;
        uuids.rotate_after_resync();
        assert_eq!(uuids, before);
    }

    #[test]
    fn test_history_lookup_ignores_primary_bit() {
        let mut uuids = UuidSet::new();
        uuids.history = [0x4242, 0];
        assert!(uuids.history_contains(0x4243));
        assert!(!uuids.history_contains(0x9999));
        assert!(!uuids.history_contains(0), "empty slots never match");
    }

    #[test]
    fn test_adopt_current_strips_marker() {
        let mut uuids = UuidSet::new();
        uuids.adopt_current(0x5001);
        assert_eq!(uuids.current, 0x5000);
    }
}
