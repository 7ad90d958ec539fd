//! Topology Op Coordinator.
//!
//! `Update` is the state machine that owns one topology change end to
//! end. It does not drive itself: [`crate::engine::Engine`] calls into it
//! while performing split/merge/rewrite/update-key, and the publication
//! worker calls [`Update::mark_node_written`] / [`Update::nodes_written`]
//! as writes complete. Keeping `Update` free of direct journal/allocator
//! I/O (it only records what happened) is what makes releasing every
//! scoped resource on every exit path tractable: everything it holds is
//! returned to its owner in [`Update::teardown`], called exactly once.
use crate::allocator::{Allocator, DiskReservation, OpenBucket};
use crate::bkey::BKey;
use crate::journal::{Journal, JournalEntry, JournalPin, JournalPreReservation};
use crate::node::NodeHandle;
use crate::pos::BtreeId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct UpdateId(pub u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> UpdateId {
    UpdateId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// What this topology change is publishing into.
pub enum Mode {
    NoUpdate,
    /// Publication inserts `new_keys` into this parent node.
    UpdatingNode(NodeHandle),
    /// Publication swaps the tree's root.
    UpdatingRoot,
    /// This update's publication has been folded into `other`'s; `other`
    /// will publish on this update's behalf.
    UpdatingAs(Arc<Update>),
}

/// Everything about an `Update` that reparenting or the publication
/// worker must touch while *other* code might also be touching it.
/// Lock-ordering rule: when two updates' `linkage` must be held together
/// (reparenting), always lock the lower [`UpdateId`] first.
pub struct Linkage {
    pub mode: Mode,
    pub disk_reservation: Option<DiskReservation>,
    pub journal_preres: Option<JournalPreReservation>,
    pub journal_pin: Option<JournalPin>,
    pub new_nodes: Vec<NodeHandle>,
    pub prealloc: Vec<NodeHandle>,
    pub old_keys: Vec<BKey>,
    pub new_keys: Vec<BKey>,
    pub journal_entries: Vec<JournalEntry>,
    pub open_buckets: Vec<OpenBucket>,
}

impl Linkage {
    fn new() -> Self {
        Linkage {
            mode: Mode::NoUpdate,
            disk_reservation: None,
            journal_preres: None,
            journal_pin: None,
            new_nodes: Vec::new(),
            prealloc: Vec::new(),
            old_keys: Vec::new(),
            new_keys: Vec::new(),
            journal_entries: Vec::new(),
            open_buckets: Vec::new(),
        }
    }
}

pub struct Update {
    pub id: UpdateId,
    pub btree_id: BtreeId,
    pub linkage: Mutex<Linkage>,
    /// Number of `new_nodes` whose `will_make_reachable` ref has not yet
    /// been cleared by a first successful write. Reaches zero exactly
    /// once, from whichever of {write-completion, will_free_node/drop}
    /// wins the race on a given node's slot.
    completion: AtomicUsize,
    pub nodes_written: AtomicBool,
}

impl Update {
    pub fn new(btree_id: BtreeId) -> Arc<Update> {
        Arc::new(Update {
            id: next_id(),
            btree_id,
            linkage: Mutex::new(Linkage::new()),
            completion: AtomicUsize::new(0),
            nodes_written: AtomicBool::new(false),
        })
    }

    /// Register a freshly constructed node as one this update must make
    /// reachable; bumps the completion counter.
    pub fn add_new_node(self: &Arc<Self>, node: NodeHandle) {
        {
            let mut tracking = node.tracking.lock();
            tracking.will_make_reachable = Some(self.clone());
        }
        self.completion.fetch_add(1, Ordering::AcqRel);
        self.linkage.lock().new_nodes.push(node);
    }

    /// First successful write of `node` completing: clear its
    /// `will_make_reachable` slot if this update still owns it (compare
    /// by identity; only the owner clears it) and decrement completion.
    /// Returns true if this call was the one that cleared it.
    pub fn mark_node_written(self: &Arc<Self>, node: &NodeHandle) -> bool {
        let mut tracking = node.tracking.lock();
        let owned_by_us = matches!(
            &tracking.will_make_reachable,
            Some(owner) if Arc::ptr_eq(owner, self)
        );
        if owned_by_us {
            tracking.will_make_reachable = None;
            drop(tracking);
            self.completion.fetch_sub(1, Ordering::AcqRel);
        }
        owned_by_us
    }

    /// All of this update's new nodes are durable.
    pub fn all_written(&self) -> bool {
        self.completion.load(Ordering::Acquire) == 0
    }

    /// Redirect `other`'s publication onto `self`: `other.mode` becomes
    /// `UpdatingAs(self)`, and `self` absorbs whichever journal pin is
    /// older. Caller must lock in ascending-id order; this method
    /// enforces it.
    pub fn absorb(self: &Arc<Self>, other: &Arc<Update>, journal: &dyn Journal) {
        let (first, second) = if self.id <= other.id {
            (self.as_ref(), other.as_ref())
        } else {
            (other.as_ref(), self.as_ref())
        };
        let (mut a, mut b) = (first.linkage.lock(), second.linkage.lock());
        let (self_linkage, other_linkage) = if std::ptr::eq(first, self.as_ref()) {
            (&mut a, &mut b)
        } else {
            (&mut b, &mut a)
        };
        if let Some(other_pin) = other_linkage.journal_pin.take() {
            self_linkage.journal_pin = Some(match self_linkage.journal_pin {
                Some(mine) => journal.pin_copy_oldest(mine, other_pin),
                None => other_pin,
            });
        }
        other_linkage.mode = Mode::UpdatingAs(self.clone());
    }

    /// Release every resource this update still holds, regardless of
    /// whether it published successfully. Safe to call more than once;
    /// subsequent calls are no-ops since the fields are already `None`.
    pub fn teardown(
        self: &Arc<Self>,
        journal: &dyn Journal,
        allocator: &dyn Allocator,
        pool: &crate::pool::NodeReservePool,
    ) {
        let mut linkage = self.linkage.lock();
        if let Some(res) = linkage.disk_reservation.take() {
            allocator.release_disk_reservation(res);
        }
        if let Some(preres) = linkage.journal_preres.take() {
            journal.preres_put(preres);
        }
        if let Some(pin) = linkage.journal_pin.take() {
            journal.pin_drop(pin);
        }
        for bucket in linkage.open_buckets.drain(..) {
            allocator.open_bucket_put(bucket);
        }
        for node in linkage.prealloc.drain(..) {
            if let Some(leftover) = pool.reserve_put(node) {
                drop(leftover);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeCell};
    use crate::pos::Pos;

    fn node() -> NodeHandle {
        NodeCell::new(Node::new_empty(BtreeId(1), 0, Pos::MIN, Pos::MAX))
    }

    #[test]
    fn counter_owned_by_cas_winner() {
        let update = Update::new(BtreeId(1));
        let handle = node();
        update.add_new_node(handle.clone());
        assert!(!update.all_written());

        // Whichever caller observes the slot first clears it and owns the
        // completion decrement; the other ordering (a second caller for
        // the same node) must be a no-op rather than double-decrementing.
        assert!(update.mark_node_written(&handle));
        assert!(update.all_written());
        assert!(
            !update.mark_node_written(&handle),
            "slot already cleared, the losing caller must not decrement again"
        );
    }

    #[test]
    fn mark_node_written_is_a_no_op_for_a_non_owning_update() {
        let owner = Update::new(BtreeId(1));
        let other = Update::new(BtreeId(1));
        let handle = node();
        owner.add_new_node(handle.clone());

        assert!(
            !other.mark_node_written(&handle),
            "a different update must never clear another update's slot"
        );
        assert!(!owner.all_written(), "the real owner's counter must be untouched by the other update's attempt");
        assert!(owner.mark_node_written(&handle));
        assert!(owner.all_written());
    }
}
