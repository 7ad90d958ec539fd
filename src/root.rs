//! Root table.
//!
//! One mutex-protected root pointer per btree. Swapping the root always
//! takes the *old* root's write lock first, so any reader already
//! traversing into it finishes before the pointer moves, and no new
//! traversal can start through the stale root once the swap is visible.
use crate::node::NodeHandle;
use crate::pos::BtreeId;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct RootTable {
    roots: Mutex<HashMap<BtreeId, NodeHandle>>,
}

impl RootTable {
    pub fn new() -> Self {
        RootTable::default()
    }

    pub fn get(&self, btree_id: BtreeId) -> Option<NodeHandle> {
        self.roots.lock().get(&btree_id).cloned()
    }

    /// Swap in `new` as the root for `btree_id`, returning the previous
    /// root (if any). Takes the old root's write lock for the duration of
    /// the swap so concurrent readers can't observe a torn pointer.
    pub fn swap(&self, btree_id: BtreeId, new: NodeHandle) -> Option<NodeHandle> {
        let mut roots = self.roots.lock();
        if let Some(old) = roots.get(&btree_id).cloned() {
            let intent = old.content.lock_intent();
            let write_guard = intent.upgrade_to_write();
            let previous = roots.insert(btree_id, new);
            drop(write_guard);
            drop(intent);
            previous
        } else {
            roots.insert(btree_id, new)
        }
    }

    /// Recovery bootstrap (`root_for_read`): install a root reconstructed
    /// from replaying `{BtreeRoot}` journal entries, without going through
    /// the live-reader write-lock dance (nothing can be reading yet).
    pub fn recover(&self, btree_id: BtreeId, node: NodeHandle) {
        self.roots.lock().insert(btree_id, node);
    }

    pub fn btree_ids(&self) -> Vec<BtreeId> {
        self.roots.lock().keys().copied().collect()
    }
}
