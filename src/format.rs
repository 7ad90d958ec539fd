//! Format Planner.
//!
//! For each node, scan all live keys and propose the minimal packed-key
//! format (bit-widths per field) that still packs every key. The fit test
//! returns true iff the node's keys, repacked under that format, still fit
//! in one block.
use crate::bkey::BKey;
use crate::node::Node;
use crate::pos::Pos;

/// Packed-key format: bit-widths sufficient to represent every live key
/// seen while the format was built, relative to the node's `min_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub pos_bits: u32,
    pub value_bits: u32,
}

impl Format {
    pub const EMPTY: Format = Format {
        pos_bits: 0,
        value_bits: 0,
    };

    /// Packed size of one key under this format, in `u64` words, rounded up.
    pub fn key_u64s(&self) -> u32 {
        let bits = self.pos_bits + self.value_bits;
        (bits + 63) / 64
    }
}

/// Accumulates the bit-widths needed to cover a set of keys.
#[derive(Debug, Default)]
pub struct FormatState {
    max_pos_bits: u32,
    max_value_bits: u32,
    saw_any: bool,
}

impl FormatState {
    pub fn new() -> Self {
        FormatState::default()
    }

    pub fn add_pos(&mut self, base: Pos, pos: Pos) {
        self.max_pos_bits = self.max_pos_bits.max(pos.bits_above(base));
        self.saw_any = true;
    }

    pub fn add_key(&mut self, base: Pos, key: &BKey) {
        self.add_pos(base, key.pos());
        // A v2 pointer's extra fields (child_min_key/child_seq) cost a
        // fixed handful of bits beyond a v1 pointer's plain locator; we
        // don't need byte-exact packing here, only a monotonic cost so the
        // planner can decide whether a reformat still fits.
        let value_bits = match key {
            BKey::Live {
                value: crate::bkey::BtreePointer::V1 { .. },
                ..
            } => 48,
            BKey::Live {
                value: crate::bkey::BtreePointer::V2 { .. },
                ..
            } => 80,
            BKey::Whiteout { .. } => 0,
        };
        self.max_value_bits = self.max_value_bits.max(value_bits);
    }

    pub fn done(&self) -> Format {
        if !self.saw_any {
            return Format::EMPTY;
        }
        Format {
            pos_bits: self.max_pos_bits.max(1),
            value_bits: self.max_value_bits,
        }
    }
}

/// Computes the minimal format that packs every live (non-whiteout) key in
/// `node`, seeded with the node's `min_key`.
pub fn calc_format(node: &Node) -> Format {
    let mut state = FormatState::new();
    state.add_pos(node.min_key, node.min_key);
    for key in node.bset.iter() {
        if !key.is_whiteout() {
            state.add_key(node.min_key, key);
        }
    }
    state.done()
}

/// Total packed size of `node`'s live keys under `format`, in `u64` words.
/// Whiteouts are dropped when reformatting (`alloc_replacement` compacts
/// them away), so only live keys count.
pub fn node_u64s_with_format(node: &Node, format: &Format) -> usize {
    let live = node.bset.iter().filter(|k| !k.is_whiteout()).count();
    live * format.key_u64s() as usize
}

/// Would reformatting `node` under `format` still fit the node in one block?
pub fn format_fits(node: &Node, format: &Format, block_size: usize) -> bool {
    node_u64s_with_format(node, format) * 8 < block_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{BtreePointer, NodeLocator};
    use crate::pos::BtreeId;

    #[test]
    fn empty_format_has_zero_key_u64s() {
        assert_eq!(Format::EMPTY.key_u64s(), 0);
    }

    #[test]
    fn format_fits_empty_node_in_any_block_size() {
        let node = Node::new_empty(BtreeId(1), 0, Pos::MIN, Pos::MAX);
        let format = calc_format(&node);
        assert!(format_fits(&node, &format, 64));
    }

    #[test]
    fn whiteouts_cost_nothing_in_format_or_size() {
        let mut node = Node::new_empty(BtreeId(1), 0, Pos::MIN, Pos::MAX);
        node.bset.push(BKey::Whiteout { pos: Pos(5) });
        let format = calc_format(&node);
        assert_eq!(node_u64s_with_format(&node, &format), 0);
    }

    #[test]
    fn calc_format_covers_every_live_key() {
        let mut node = Node::new_empty(BtreeId(1), 0, Pos::MIN, Pos::MAX);
        node.bset.push(BKey::Live {
            pos: Pos(1000),
            value: BtreePointer::V1 {
                locator: NodeLocator { device: 0, offset: 0 },
            },
        });
        let format = calc_format(&node);
        assert!(format.pos_bits >= Pos(1000).bits_above(node.min_key));
    }
}
