//! Keys stored in an interior node's bset.
//!
//! Interior-node values are btree-pointers (v1 or v2); v2 additionally
//! carries the child's exact `min_key` and the child's bset sequence
//! number. The on-disk extent a pointer resolves to is owned by the
//! allocator collaborator and modeled here as an opaque [`NodeLocator`].
use crate::pos::Pos;
use serde::{Deserialize, Serialize};

/// An allocator-owned locator for a node's backing disk extent. Opaque to
/// this crate; the allocator collaborator is the only thing that
/// interprets it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct NodeLocator {
    pub device: u16,
    pub offset: u64,
}

/// A btree-pointer value, v1 or v2.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BtreePointer {
    V1 { locator: NodeLocator },
    V2 {
        locator: NodeLocator,
        child_min_key: Pos,
        child_seq: u64,
    },
}

impl BtreePointer {
    pub fn locator(&self) -> NodeLocator {
        match self {
            BtreePointer::V1 { locator } | BtreePointer::V2 { locator, .. } => *locator,
        }
    }
}

/// A single entry in a node's bset: either a live btree-pointer at a
/// position, or a whiteout (deleted-key marker) left behind until
/// compaction removes it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BKey {
    Live { pos: Pos, value: BtreePointer },
    Whiteout { pos: Pos },
}

impl BKey {
    pub fn pos(&self) -> Pos {
        match self {
            BKey::Live { pos, .. } | BKey::Whiteout { pos } => *pos,
        }
    }

    pub fn is_whiteout(&self) -> bool {
        matches!(self, BKey::Whiteout { .. })
    }

    pub fn as_pointer(&self) -> Option<&BtreePointer> {
        match self {
            BKey::Live { value, .. } => Some(value),
            BKey::Whiteout { .. } => None,
        }
    }

    /// Rough packed size in `u64`s of this key under some format, ignoring
    /// per-field bit widths (the format planner refines this). Used as the
    /// baseline before [`crate::format::Format`] bit-width savings are
    /// applied.
    pub fn unpacked_u64s() -> u32 {
        // header + position + value, rounded to a u64 word. Four words is
        // a conservative stand-in for an unpacked key (pos + small
        // pointer value).
        4
    }
}
