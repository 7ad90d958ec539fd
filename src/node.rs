//! Interior node content and per-node update-tracking metadata.
//!
//! A node's content (bset, format, flags) is protected by the six-state
//! [`SixLock`]; the bookkeeping an in-flight [`crate::update::Update`] needs
//! to attach to a node (`write_blocked`, `will_make_reachable`) is kept
//! separate, in [`NodeTracking`], since it isn't part of the node's content
//! and reading it must never require the six-lock.
use crate::bkey::BKey;
use crate::flags::NodeFlags;
use crate::format::Format;
use crate::lock::SixLock;
use crate::pos::{BtreeId, Pos};
use crate::update::Update;
use parking_lot::Mutex;
use std::sync::Arc;

/// A node's sorted set of keys. Plain `Vec` kept in `Pos` order; real
/// bsets are packed and merge multiple generations, which is out of scope
/// here.
pub type Bset = Vec<BKey>;

/// Insert `key` into `bset`, replacing any existing entry at the same
/// position (last-writer-wins, matching whiteout-over-stale-pointer
/// semantics) and keeping `bset` sorted by `pos`.
pub fn bset_upsert(bset: &mut Bset, key: BKey) {
    match bset.binary_search_by_key(&key.pos(), |k| k.pos()) {
        Ok(idx) => bset[idx] = key,
        Err(idx) => bset.insert(idx, key),
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub btree_id: BtreeId,
    pub level: u32,
    pub min_key: Pos,
    pub max_key: Pos,
    /// Bumped on every write; carried in v2 pointers as `child_seq`.
    pub seq: u64,
    pub format: Format,
    pub bset: Bset,
    pub flags: NodeFlags,
    /// Free space on each neighbor sibling, in packed `u64`s, used by the
    /// foreground-merge threshold check. `[left, right]`.
    pub sib_u64s: [u32; 2],
}

impl Node {
    pub fn new_empty(btree_id: BtreeId, level: u32, min_key: Pos, max_key: Pos) -> Self {
        Node {
            btree_id,
            level,
            min_key,
            max_key,
            seq: 0,
            format: Format::EMPTY,
            bset: Vec::new(),
            flags: NodeFlags::empty(),
            sib_u64s: [0, 0],
        }
    }

    pub fn live_u64s(&self) -> usize {
        self.bset.iter().filter(|k| !k.is_whiteout()).count() * self.format.key_u64s() as usize
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(NodeFlags::DIRTY)
    }

    pub fn mark_dirty(&mut self) {
        self.flags.insert(NodeFlags::DIRTY);
    }

    pub fn clear_dirty_after_write(&mut self) {
        self.flags.remove(NodeFlags::DIRTY | NodeFlags::NEED_WRITE);
    }
}

/// Update-bookkeeping attached to a node, independent of its six-locked
/// content.
#[derive(Default)]
pub struct NodeTracking {
    /// Updates that asked to be notified once this node (a parent pending
    /// insertion) finishes writing, so they can proceed with a dependent
    /// insert.
    pub write_blocked: Vec<Arc<Update>>,
    /// If set, this node is a new replacement that is not yet linked into
    /// the tree; the referenced [`Update`] owns making it reachable and
    /// must be the one to decrement its completion counter. `None` once
    /// published or freed.
    pub will_make_reachable: Option<Arc<Update>>,
}

impl NodeTracking {
    pub fn new() -> Self {
        NodeTracking::default()
    }
}

/// A node's content plus its tracking metadata. [`NodeHandle`] is the
/// shared pointer type used everywhere a node is referenced.
pub struct NodeCell {
    pub content: SixLock<Node>,
    pub tracking: Mutex<NodeTracking>,
}

impl NodeCell {
    pub fn new(node: Node) -> Arc<NodeCell> {
        Arc::new(NodeCell {
            content: SixLock::new(node),
            tracking: Mutex::new(NodeTracking::new()),
        })
    }
}

pub type NodeHandle = Arc<NodeCell>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{BtreePointer, NodeLocator};

    fn key(pos: u64) -> BKey {
        BKey::Live {
            pos: Pos(pos),
            value: BtreePointer::V1 {
                locator: NodeLocator { device: 0, offset: pos },
            },
        }
    }

    #[test]
    fn bset_upsert_keeps_sorted_order() {
        let mut bset = Vec::new();
        bset_upsert(&mut bset, key(5));
        bset_upsert(&mut bset, key(1));
        bset_upsert(&mut bset, key(3));
        let positions: Vec<u64> = bset.iter().map(|k| k.pos().0).collect();
        assert_eq!(positions, vec![1, 3, 5]);
    }

    #[test]
    fn bset_upsert_replaces_existing_position() {
        let mut bset = vec![key(1)];
        bset_upsert(&mut bset, BKey::Whiteout { pos: Pos(1) });
        assert_eq!(bset.len(), 1);
        assert!(bset[0].is_whiteout());
    }

    #[test]
    fn live_u64s_ignores_whiteouts() {
        let mut node = Node::new_empty(BtreeId(1), 0, Pos::MIN, Pos::MAX);
        node.format = crate::format::Format { pos_bits: 8, value_bits: 48 };
        node.bset.push(key(1));
        node.bset.push(BKey::Whiteout { pos: Pos(2) });
        assert_eq!(node.live_u64s(), node.format.key_u64s() as usize);
    }
}
