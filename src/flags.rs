//! Per-node state flags.
//!
//! Modeled with `bitflags` rather than a handful of `bool` fields, the way
//! flag sets are represented elsewhere in this ecosystem (e.g. terminal and
//! driver flag sets in other kernel-adjacent crates).
use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct NodeFlags: u8 {
        /// Has unwritten changes.
        const DIRTY = 1 << 0;
        /// Needs to be written even if not dirty (e.g. format change only).
        const NEED_WRITE = 1 << 1;
        /// Scheduled for free; must not be written or made reachable again.
        const DYING = 1 << 2;
        /// Placeholder root at filesystem bringup.
        const FAKE = 1 << 3;
        /// In the reserve pool; excluded from LRU reaping.
        const NOEVICT = 1 << 4;
    }
}
