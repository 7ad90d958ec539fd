//! Key-Insert Fixup.
//!
//! Splices a sorted batch of btree-pointer keys into a parent's bset and
//! records the journal entries that make the insertion durable.
use crate::bkey::BKey;
use crate::flags::NodeFlags;
use crate::journal::JournalEntry;
use crate::node::{bset_upsert, Node};

/// Insert each key in `keys` into `parent`'s bset in sorted-run order,
/// returning the journal entries to append (one per key, in the same
/// order). `keys` must already be sorted by position; callers that built
/// them from a split (pivot, then remainder) already satisfy this.
pub fn insert_keys(parent: &mut Node, keys: &[BKey]) -> Vec<JournalEntry> {
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        entries.push(JournalEntry::BtreeKeys {
            btree_id: parent.btree_id,
            level: parent.level,
            key: key.clone(),
        });
        bset_upsert(&mut parent.bset, key.clone());
    }
    parent.flags.insert(NodeFlags::DIRTY | NodeFlags::NEED_WRITE);
    entries
}
