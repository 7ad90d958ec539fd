//! Node Constructor.
//!
//! Pure functions building new node *content*; callers are responsible for
//! pulling a free [`crate::node::NodeHandle`] out of the reserve pool and
//! writing the returned [`Node`] into it under the six-lock's write guard.
//! Keeping these as plain `Node -> Node` transforms (rather than having
//! them reach into the pool/lock themselves) is what makes the split/merge
//! pivot and format logic unit-testable without a running engine.
use crate::bkey::BKey;
use crate::flags::NodeFlags;
use crate::format::{calc_format, format_fits};
use crate::node::{bset_upsert, Bset, Node};
use crate::pos::{BtreeId, Pos};

/// Drop whiteouts from `bset`, keeping only live keys. Must run before a
/// node is split, so a whiteout can never be chosen as the pivot.
pub fn compact_whiteouts(bset: &mut Bset) {
    bset.retain(|k| !k.is_whiteout());
}

/// A same-range copy of `src`, bumped sequence number, repacked under
/// `src`'s freshly computed optimal format (falling back to the existing
/// format if the new one wouldn't fit).
pub fn alloc_replacement(src: &Node, block_size: usize) -> Node {
    let mut out = Node {
        btree_id: src.btree_id,
        level: src.level,
        min_key: src.min_key,
        max_key: src.max_key,
        seq: src.seq + 1,
        format: src.format,
        bset: src
            .bset
            .iter()
            .filter(|k| !k.is_whiteout())
            .cloned()
            .collect(),
        flags: NodeFlags::empty(),
        sib_u64s: [u32::MAX, u32::MAX],
    };
    let proposed = calc_format(&out);
    if format_fits(&out, &proposed, block_size) {
        out.format = proposed;
    }
    out
}

/// Walks `n1`'s bset, stops at the first key past `⌊3·u64s/5⌋`, uses that
/// key's position as the pivot, and moves the remainder into a fresh `n2`.
/// `n1` must already have whiteouts compacted.
pub fn split(n1: &mut Node, block_size: usize) -> Node {
    debug_assert!(n1.bset.iter().all(|k| !k.is_whiteout()));
    debug_assert!(n1.bset.len() >= 2, "cannot split a node with fewer than two keys");
    let key_u64s = n1.format.key_u64s().max(1) as usize;
    let target_u64s = (3 * n1.bset.len() * key_u64s) / 5;
    // Stop at the last key reached, not the last key itself, so n2 always
    // gets at least one key even when the whole bset falls under target.
    let last = n1.bset.len() - 1;
    let split_idx = {
        let mut running = 0usize;
        let mut idx = last;
        for i in 0..last {
            if running >= target_u64s {
                idx = i;
                break;
            }
            running += key_u64s;
        }
        idx.max(1)
    };

    let pivot = n1.bset[split_idx - 1].pos();
    let tail: Bset = n1.bset.split_off(split_idx);

    let max_key = n1.max_key;
    n1.max_key = pivot;
    n1.seq += 1;
    n1.format = {
        let proposed = calc_format(n1);
        if format_fits(n1, &proposed, block_size) {
            proposed
        } else {
            n1.format
        }
    };
    n1.sib_u64s = [u32::MAX, u32::MAX];

    let mut n2 = Node {
        btree_id: n1.btree_id,
        level: n1.level,
        min_key: pivot.successor(),
        max_key,
        seq: 0,
        format: crate::format::Format::EMPTY,
        bset: tail,
        flags: NodeFlags::empty(),
        sib_u64s: [u32::MAX, u32::MAX],
    };
    let proposed = calc_format(&n2);
    if format_fits(&n2, &proposed, block_size) {
        n2.format = proposed;
    }
    n2
}

/// One node covering `[prev.min_key, next.max_key]` holding the union of
/// both bsets' live keys, under the union format.
pub fn merge(prev: &Node, next: &Node, block_size: usize) -> Node {
    debug_assert_eq!(prev.btree_id, next.btree_id);
    debug_assert_eq!(prev.level, next.level);
    let mut out = Node {
        btree_id: prev.btree_id,
        level: prev.level,
        min_key: prev.min_key,
        max_key: next.max_key,
        seq: prev.seq.max(next.seq) + 1,
        format: crate::format::Format::EMPTY,
        bset: Vec::with_capacity(prev.bset.len() + next.bset.len()),
        flags: NodeFlags::empty(),
        sib_u64s: [u32::MAX, u32::MAX],
    };
    for key in prev
        .bset
        .iter()
        .chain(next.bset.iter())
        .filter(|k| !k.is_whiteout())
    {
        bset_upsert(&mut out.bset, key.clone());
    }
    let proposed = calc_format(&out);
    if format_fits(&out, &proposed, block_size) {
        out.format = proposed;
    }
    out
}

/// A fresh, empty root spanning the whole key space.
pub fn root_alloc(btree_id: BtreeId, level: u32) -> Node {
    Node::new_empty(btree_id, level, Pos::MIN, Pos::MAX)
}

/// Union format size in packed `u64`s of `a ∪ b`'s live keys, used by the
/// foreground-merge threshold check without materializing the merged
/// node.
pub fn union_u64s(a: &Node, b: &Node) -> usize {
    let mut state = crate::format::FormatState::new();
    state.add_pos(a.min_key, a.min_key);
    for key in a.bset.iter().chain(b.bset.iter()) {
        if !key.is_whiteout() {
            state.add_key(a.min_key, key);
        }
    }
    let format = state.done();
    let live = a
        .bset
        .iter()
        .chain(b.bset.iter())
        .filter(|k: &&BKey| !k.is_whiteout())
        .count();
    live * format.key_u64s() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{BtreePointer, NodeLocator};

    fn leaf_node(keys: &[u64]) -> Node {
        let mut node = Node::new_empty(BtreeId(1), 0, Pos::MIN, Pos::MAX);
        for &k in keys {
            node.bset.push(BKey::Live {
                pos: Pos(k),
                value: BtreePointer::V1 {
                    locator: NodeLocator { device: 0, offset: k },
                },
            });
        }
        node.format = calc_format(&node);
        node
    }

    #[test]
    fn split_pivot_is_never_a_whiteout() {
        let mut n1 = leaf_node(&[1, 2, 3, 4, 5]);
        let n2 = split(&mut n1, 4096);
        assert!(!n1.bset.last().unwrap().is_whiteout());
        assert_eq!(n1.max_key, n1.bset.last().unwrap().pos());
        assert_eq!(n2.min_key, n1.max_key.successor());
        assert_eq!(n2.max_key, Pos::MAX);
    }

    #[test]
    fn split_covers_original_range_with_no_gap() {
        let mut n1 = leaf_node(&[10, 20, 30, 40]);
        let original_min = n1.min_key;
        let original_max = n1.max_key;
        let n2 = split(&mut n1, 4096);
        assert_eq!(n1.min_key, original_min);
        assert_eq!(n2.max_key, original_max);
        assert_eq!(n2.min_key, n1.max_key.successor());
    }

    #[test]
    fn compact_whiteouts_drops_only_whiteouts() {
        let mut bset = vec![
            BKey::Whiteout { pos: Pos(1) },
            BKey::Live {
                pos: Pos(2),
                value: BtreePointer::V1 {
                    locator: NodeLocator { device: 0, offset: 2 },
                },
            },
        ];
        compact_whiteouts(&mut bset);
        assert_eq!(bset.len(), 1);
        assert!(!bset[0].is_whiteout());
    }

    #[test]
    fn merge_covers_union_range_and_keys() {
        let prev = leaf_node(&[1, 2]);
        let mut next = leaf_node(&[12]);
        next.min_key = Pos(11);
        next.max_key = Pos(20);
        let merged = merge(&prev, &next, 4096);
        assert_eq!(merged.min_key, prev.min_key);
        assert_eq!(merged.max_key, next.max_key);
        assert_eq!(merged.bset.len(), 3);
    }

    #[test]
    fn alloc_replacement_drops_whiteouts_and_bumps_seq() {
        let mut src = leaf_node(&[1, 2]);
        src.bset.push(BKey::Whiteout { pos: Pos(3) });
        src.seq = 5;
        let replacement = alloc_replacement(&src, 4096);
        assert_eq!(replacement.seq, 6);
        assert_eq!(replacement.bset.len(), 2);
        assert!(replacement.bset.iter().all(|k| !k.is_whiteout()));
    }
}
