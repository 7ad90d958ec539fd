//! Key positions.
//!
//! A full key packs an inode, an offset and a snapshot id; encoding and
//! comparing that triple is the leaf key/value path, which lives outside
//! this engine. All the topology code here needs is a totally ordered key
//! space with a minimum, a maximum, and a successor/predecessor function,
//! so `Pos` is a thin wrapper around `u64`.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pos(pub u64);

impl Pos {
    pub const MIN: Pos = Pos(u64::MIN);
    pub const MAX: Pos = Pos(u64::MAX);

    /// The smallest position strictly greater than `self`, saturating at
    /// [`Pos::MAX`].
    pub fn successor(self) -> Pos {
        Pos(self.0.saturating_add(1))
    }

    /// The largest position strictly smaller than `self`, saturating at
    /// [`Pos::MIN`].
    pub fn predecessor(self) -> Pos {
        Pos(self.0.saturating_sub(1))
    }

    /// Number of bits needed to represent `self` relative to `base`,
    /// i.e. `self - base`, used by the format planner.
    pub fn bits_above(self, base: Pos) -> u32 {
        let delta = self.0.saturating_sub(base.0);
        64 - delta.leading_zeros()
    }
}

impl fmt::Debug for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Pos::MIN {
            write!(f, "POS_MIN")
        } else if *self == Pos::MAX {
            write!(f, "POS_MAX")
        } else {
            write!(f, "Pos({})", self.0)
        }
    }
}

/// Identifies which btree a node/key belongs to. Multiple trees can share
/// one [`crate::engine::Engine`] and reserve pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct BtreeId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_and_predecessor_saturate() {
        assert_eq!(Pos::MAX.successor(), Pos::MAX);
        assert_eq!(Pos::MIN.predecessor(), Pos::MIN);
        assert_eq!(Pos(5).successor(), Pos(6));
        assert_eq!(Pos(5).predecessor(), Pos(4));
    }

    #[test]
    fn bits_above_is_zero_at_base() {
        assert_eq!(Pos(10).bits_above(Pos(10)), 0);
    }

    #[test]
    fn bits_above_grows_with_distance() {
        assert!(Pos(1000).bits_above(Pos(0)) > Pos(10).bits_above(Pos(0)));
    }

    #[test]
    fn debug_prints_sentinels() {
        assert_eq!(format!("{:?}", Pos::MIN), "POS_MIN");
        assert_eq!(format!("{:?}", Pos::MAX), "POS_MAX");
        assert_eq!(format!("{:?}", Pos(7)), "Pos(7)");
    }
}
