//! Topology engine entry points.
//!
//! Ties the reserve pool, format planner, constructor, fixup, journal,
//! allocator, node cache and root table together behind the four upward
//! operations plus root/recovery/introspection helpers. Publication
//! (the `nodes_written` pass) runs on a single background worker fed by a
//! `crossbeam-channel`, a single-worker FIFO queue; each public entry
//! point blocks on an acknowledgement from that worker before returning,
//! so callers see ordinary synchronous `Result`s.
use crate::allocator::Allocator;
use crate::bkey::{BKey, BtreePointer, NodeLocator};
use crate::cache::{NodeCache, NodeKey};
use crate::config::EngineConfig;
use crate::constructor;
use crate::error::{Error, ErrorKind, Result};
use crate::fixup;
use crate::journal::{Journal, JournalEntry};
use crate::node::{Node, NodeCell, NodeHandle};
use crate::pool::{NodeReservePool, ReserveClass};
use crate::pos::{BtreeId, Pos};
use crate::root::RootTable;
use crate::update::{Mode, Update, UpdateId};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Default)]
struct Lists {
    all_updates: Vec<Arc<Update>>,
    unwritten: VecDeque<UpdateId>,
}

struct Shared {
    config: EngineConfig,
    journal: Arc<dyn Journal>,
    allocator: Arc<dyn Allocator>,
    cache: NodeCache,
    pool: NodeReservePool,
    roots: RootTable,
    lists: Mutex<Lists>,
    gc_lock: RwLock<()>,
}

/// A pending publication job: the update to publish, and the channel to
/// signal on once its `nodes_written` pass has run.
struct PublishJob {
    update: Arc<Update>,
    ack: Sender<()>,
}

pub struct Engine {
    shared: Arc<Shared>,
    publish_tx: Sender<PublishJob>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: EngineConfig, journal: Arc<dyn Journal>, allocator: Arc<dyn Allocator>) -> Engine {
        let pool = NodeReservePool::new(&config);
        let shared = Arc::new(Shared {
            config,
            journal,
            allocator,
            cache: NodeCache::new(),
            pool,
            roots: RootTable::new(),
            lists: Mutex::new(Lists::default()),
            gc_lock: RwLock::new(()),
        });

        let (publish_tx, publish_rx): (Sender<PublishJob>, Receiver<PublishJob>) =
            crossbeam_channel::unbounded();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("btree-topology-publish".into())
            .spawn(move || {
                for job in publish_rx.iter() {
                    publish_pass(&worker_shared, &job.update);
                    let _ = job.ack.send(());
                }
            })
            .expect("spawn publication worker");

        Engine {
            shared,
            publish_tx,
            worker: Some(worker),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &NodeCache {
        &self.shared.cache
    }

    pub fn roots(&self) -> &RootTable {
        &self.shared.roots
    }

    fn start_update(&self, btree_id: BtreeId, nr_nodes: usize, class: ReserveClass) -> Result<Arc<Update>> {
        if self.shared.journal.is_errored() {
            warn!("btree {}: journal errored, refusing new topology update", btree_id.0);
            return Err(Error::from(ErrorKind::JournalError));
        }
        let update = Update::new(btree_id);
        trace!("btree {}: starting update {} (nr_nodes={})", btree_id.0, update.id.0, nr_nodes);
        {
            let preres = self
                .shared
                .journal
                .preres_get(self.shared.config.btree_update_journal_res)?;
            let bytes = (nr_nodes
                * self.shared.config.btree_node_size
                * self.shared.config.metadata_replicas as usize) as u64;
            let disk_res = match self.shared.allocator.reserve_disk_space(bytes) {
                Ok(r) => r,
                Err(e) => {
                    self.shared.journal.preres_put(preres);
                    return Err(e);
                }
            };
            let pin = self.shared.journal.add_pin();
            let mut prealloc = Vec::with_capacity(nr_nodes);
            let nr_reserve = self.shared.config.nr_reserve(class);
            for _ in 0..nr_nodes {
                match self.shared.pool.reserve_get(class, nr_reserve) {
                    Some(node) => prealloc.push(node),
                    None => {
                        let (locator, buckets) = self
                            .shared
                            .allocator
                            .alloc_node_extent(self.shared.config.metadata_replicas)?;
                        let _ = locator;
                        let placeholder = NodeCell::new(Node::new_empty(
                            btree_id,
                            0,
                            Pos::MIN,
                            Pos::MIN,
                        ));
                        update.linkage.lock().open_buckets.extend(buckets);
                        prealloc.push(placeholder);
                    }
                }
            }
            let mut linkage = update.linkage.lock();
            linkage.journal_preres = Some(preres);
            linkage.disk_reservation = Some(disk_res);
            linkage.journal_pin = Some(pin);
            linkage.prealloc = prealloc;
        }
        self.shared.lists.lock().all_updates.push(update.clone());
        Ok(update)
    }

    fn take_prealloc(&self, update: &Arc<Update>) -> NodeHandle {
        let mut linkage = update.linkage.lock();
        linkage
            .prealloc
            .pop()
            .unwrap_or_else(|| NodeCell::new(Node::new_empty(update.btree_id, 0, Pos::MIN, Pos::MIN)))
    }

    /// Reparent `b`'s waiters onto `update` and mark `b` dying.
    /// `intent` must be the caller's own already-held intent guard on `b`:
    /// this never takes a fresh one, since a thread that already holds
    /// intent on a node calling `lock_intent` on it again would deadlock
    /// against itself.
    fn will_free_node(
        &self,
        update: &Arc<Update>,
        b: &NodeHandle,
        intent: &crate::lock::IntentGuard<'_, Node>,
    ) {
        let waiters: Vec<Arc<Update>> = {
            let mut tracking = b.tracking.lock();
            std::mem::take(&mut tracking.write_blocked)
        };
        for waiter in &waiters {
            update.absorb(waiter, self.shared.journal.as_ref());
        }
        let owner = b.tracking.lock().will_make_reachable.clone();
        if let Some(owner) = owner {
            owner.mark_node_written(b);
        }
        let mut write = intent.upgrade_to_write();
        write.flags.insert(crate::flags::NodeFlags::DYING);
    }

    fn enqueue_publish(&self, update: Arc<Update>) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.shared.lists.lock().unwritten.push_back(update.id);
        let _ = self.publish_tx.send(PublishJob {
            update,
            ack: ack_tx,
        });
        let _ = ack_rx.recv();
    }

    fn finish(&self, update: Arc<Update>) {
        update.teardown(
            self.shared.journal.as_ref(),
            self.shared.allocator.as_ref(),
            &self.shared.pool,
        );
        let mut lists = self.shared.lists.lock();
        lists.all_updates.retain(|u| u.id != update.id);
    }

    /// Split (or straight-replace) `node`, and either insert the result
    /// into `parent` or swap the tree's root, depending on whether
    /// `parent` is supplied.
    pub fn split_leaf(&self, node: &NodeHandle, parent: Option<&NodeHandle>) -> Result<()> {
        self.do_split(node, parent, &[])
    }

    /// Split (or replace) `b`, splicing `extra_keys` into the replacement
    /// before deciding whether it needs to split further.
    pub fn do_split(
        &self,
        b: &NodeHandle,
        parent: Option<&NodeHandle>,
        extra_keys: &[BKey],
    ) -> Result<()> {
        let _gc = self.shared.gc_lock.read();
        let b_intent = b.content.lock_intent();
        let src_snapshot = b_intent.read().clone();

        let update = self.start_update(src_snapshot.btree_id, 2, ReserveClass::None)?;
        self.will_free_node(&update, b, &b_intent);
        drop(b_intent);

        let mut n1 = constructor::alloc_replacement(&src_snapshot, self.shared.config.btree_node_size);
        if !extra_keys.is_empty() {
            let entries = fixup::insert_keys(&mut n1, extra_keys);
            update.linkage.lock().journal_entries.extend(entries);
        }

        let n1_handle = self.take_prealloc(&update);
        let mut new_keys = Vec::new();

        if n1.live_u64s() > self.shared.config.split_threshold_u64s {
            debug!(
                "btree {}: splitting node at {:?}, {} u64s over threshold",
                src_snapshot.btree_id.0,
                src_snapshot.min_key,
                n1.live_u64s() - self.shared.config.split_threshold_u64s
            );
            constructor::compact_whiteouts(&mut n1.bset);
            let n2 = constructor::split(&mut n1, self.shared.config.btree_node_size);
            {
                *n1_handle.content.lock_intent().upgrade_to_write() = n1.clone();
            }
            let n2_handle = self.take_prealloc(&update);
            {
                *n2_handle.content.lock_intent().upgrade_to_write() = n2.clone();
            }
            update.add_new_node(n1_handle.clone());
            update.add_new_node(n2_handle.clone());
            new_keys.push(self.make_pointer_key(&n1, &update)?);
            new_keys.push(self.make_pointer_key(&n2, &update)?);

            match parent {
                Some(p) => self.insert_node(p, &new_keys, &update)?,
                None => {
                    let mut root = constructor::root_alloc(src_snapshot.btree_id, src_snapshot.level + 1);
                    let root_handle = self.take_prealloc_or_fresh(&update, root.btree_id);
                    let entries = fixup::insert_keys(&mut root, &new_keys);
                    update.linkage.lock().journal_entries.extend(entries);
                    *root_handle.content.lock_intent().upgrade_to_write() = root;
                    update.add_new_node(root_handle.clone());
                    self.set_root(&update, root_handle);
                }
            }
            self.publish_new_nodes(&update, &[n1_handle, n2_handle]);
        } else {
            {
                *n1_handle.content.lock_intent().upgrade_to_write() = n1.clone();
            }
            update.add_new_node(n1_handle.clone());
            new_keys.push(self.make_pointer_key(&n1, &update)?);
            match parent {
                Some(p) => self.insert_node(p, &new_keys, &update)?,
                None => self.set_root(&update, n1_handle.clone()),
            }
            self.publish_new_nodes(&update, &[n1_handle]);
        }

        self.enqueue_publish(update.clone());
        self.finish(update);
        Ok(())
    }

    fn take_prealloc_or_fresh(&self, update: &Arc<Update>, btree_id: BtreeId) -> NodeHandle {
        let mut linkage = update.linkage.lock();
        linkage
            .prealloc
            .pop()
            .unwrap_or_else(|| NodeCell::new(Node::new_empty(btree_id, 0, Pos::MIN, Pos::MAX)))
    }

    fn make_pointer_key(&self, node: &Node, update: &Arc<Update>) -> Result<BKey> {
        let (locator, buckets) = self
            .shared
            .allocator
            .alloc_node_extent(self.shared.config.metadata_replicas)?;
        update.linkage.lock().open_buckets.extend(buckets);
        Ok(BKey::Live {
            pos: node.max_key,
            value: BtreePointer::V2 {
                locator,
                child_min_key: node.min_key,
                child_seq: node.seq,
            },
        })
    }

    /// Record new nodes as durable immediately: this reference allocator
    /// never actually delays a write, so there is nothing to wait on
    /// before clearing `will_make_reachable` (the race for that slot is
    /// still exercised by reparenting, which can beat this to the clear).
    fn publish_new_nodes(&self, update: &Arc<Update>, nodes: &[NodeHandle]) {
        for node in nodes {
            let key = {
                let content = node.content.read();
                NodeKey {
                    btree_id: content.btree_id,
                    level: content.level,
                    min_key: content.min_key,
                }
            };
            self.shared.cache.insert(key, node.clone());
            update.mark_node_written(node);
        }
    }

    /// Insert `keys` into `parent`, splitting it first if they wouldn't fit.
    fn insert_node(&self, parent: &NodeHandle, keys: &[BKey], update: &Arc<Update>) -> Result<()> {
        let intent = parent.content.lock_intent();
        let snapshot = intent.read().clone();
        let would_fit = (snapshot.live_u64s()
            + keys.len() * snapshot.format.key_u64s().max(1) as usize)
            * 8
            < self.shared.config.btree_node_size;
        if !would_fit {
            drop(intent);
            return self.do_split(parent, None, keys);
        }

        let mut write = intent.upgrade_to_write();
        let entries = fixup::insert_keys(&mut write, keys);
        drop(write);
        drop(intent);

        {
            let mut tracking = parent.tracking.lock();
            tracking.write_blocked.push(update.clone());
        }
        {
            let mut linkage = update.linkage.lock();
            linkage.journal_entries.extend(entries);
            linkage.new_keys.extend_from_slice(keys);
            linkage.mode = Mode::UpdatingNode(parent.clone());
        }
        Ok(())
    }

    fn set_root(&self, update: &Arc<Update>, new_root: NodeHandle) {
        let btree_id = update.btree_id;
        let key = {
            let content = new_root.content.read();
            let key = BKey::Live {
                pos: content.max_key,
                value: BtreePointer::V1 {
                    locator: NodeLocator {
                        device: 0,
                        offset: 0,
                    },
                },
            };
            update.linkage.lock().journal_entries.push(JournalEntry::BtreeRoot {
                btree_id,
                level: content.level,
                key: Some(key.clone()),
            });
            key
        };
        let _ = key;
        self.shared.roots.swap(btree_id, new_root.clone());
        let node_key = {
            let content = new_root.content.read();
            NodeKey {
                btree_id,
                level: content.level,
                min_key: content.min_key,
            }
        };
        self.shared.cache.set_root(btree_id, new_root.clone());
        self.shared.cache.insert(node_key, new_root);
        update.linkage.lock().mode = Mode::UpdatingRoot;
        debug!("btree {}: root swapped (level {})", btree_id.0, node_key.level);
    }

    /// Try to merge `b` with sibling `sib`, if the union of their keys
    /// fits under one node. Returns whether a merge happened.
    pub fn maybe_merge(&self, b: &NodeHandle, sib: &NodeHandle, parent: &NodeHandle) -> Result<bool> {
        let b_snap = b.content.read().clone();
        let sib_snap = sib.content.read().clone();
        let u = constructor::union_u64s(&b_snap, &sib_snap);
        let threshold = self.shared.config.foreground_merge_threshold_u64s;
        if u > threshold {
            let biased = threshold
                + (u - threshold).min(self.shared.config.foreground_merge_hysteresis_u64s);
            trace!(
                "btree {}: merge of {:?}/{:?} would be {} u64s, over threshold {}, caching hint",
                b_snap.btree_id.0, b_snap.min_key, sib_snap.min_key, u, threshold
            );
            let mut write = b.content.lock_intent().upgrade_to_write();
            write.sib_u64s[1] = biased as u32;
            return Ok(false);
        }

        let _gc = self.shared.gc_lock.read();
        let b_intent = b.content.lock_intent();
        let sib_intent = sib.content.lock_intent();

        let update = self.start_update(b_snap.btree_id, 1, ReserveClass::Btree)?;
        self.will_free_node(&update, b, &b_intent);
        self.will_free_node(&update, sib, &sib_intent);
        drop(b_intent);
        drop(sib_intent);

        let (prev, next) = if b_snap.min_key <= sib_snap.min_key {
            (&b_snap, &sib_snap)
        } else {
            (&sib_snap, &b_snap)
        };
        let merged = constructor::merge(prev, next, self.shared.config.btree_node_size);
        let merged_handle = self.take_prealloc(&update);
        *merged_handle.content.lock_intent().upgrade_to_write() = merged.clone();
        update.add_new_node(merged_handle.clone());

        let old_key = BKey::Whiteout { pos: prev.max_key };
        {
            let mut linkage = update.linkage.lock();
            linkage.old_keys.push(old_key.clone());
        }
        debug!(
            "btree {}: merging {:?} and {:?} into {:?}",
            b_snap.btree_id.0, prev.min_key, next.min_key, merged.min_key
        );
        let new_key = self.make_pointer_key(&merged, &update)?;
        // prev's pointer must be deleted from the parent, not just
        // overwritten: the merged pointer is keyed at next.max_key, so
        // without this the parent would keep a stale pointer to the
        // now-dying prev node at prev.max_key (unless prev and next share
        // the same key).
        if old_key.pos() == new_key.pos() {
            self.insert_node(parent, &[new_key], &update)?;
        } else {
            self.insert_node(parent, &[old_key, new_key], &update)?;
        }
        self.publish_new_nodes(&update, &[merged_handle]);
        self.enqueue_publish(update.clone());
        self.finish(update);
        Ok(true)
    }

    /// Refresh a node's on-disk image without changing its keys.
    pub fn rewrite(&self, b: &NodeHandle, parent: Option<&NodeHandle>) -> Result<()> {
        let _gc = self.shared.gc_lock.read();
        let b_intent = b.content.lock_intent();
        let snapshot = b_intent.read().clone();
        let update = self.start_update(snapshot.btree_id, 1, ReserveClass::None)?;
        self.will_free_node(&update, b, &b_intent);
        drop(b_intent);

        let replacement = constructor::alloc_replacement(&snapshot, self.shared.config.btree_node_size);
        let handle = self.take_prealloc(&update);
        *handle.content.lock_intent().upgrade_to_write() = replacement.clone();
        update.add_new_node(handle.clone());
        let key = self.make_pointer_key(&replacement, &update)?;
        match parent {
            Some(p) => self.insert_node(p, &[key], &update)?,
            None => self.set_root(&update, handle.clone()),
        }
        self.publish_new_nodes(&update, &[handle]);
        self.enqueue_publish(update.clone());
        self.finish(update);
        Ok(())
    }

    /// Change only `b`'s pointer value. When the key's cache slot would
    /// change, a throwaway shim node is hashed under the new key first so
    /// the cache never has zero entries resolving to `b`.
    pub fn update_key(&self, b: &NodeHandle, new_key: BKey, parent: &NodeHandle) -> Result<()> {
        let old_key = {
            let content = b.content.read();
            NodeKey {
                btree_id: content.btree_id,
                level: content.level,
                min_key: content.min_key,
            }
        };
        let new_node_key = NodeKey {
            min_key: new_key.pos(),
            ..old_key
        };
        if new_node_key != old_key {
            let shim = NodeCell::new(Node::new_empty(old_key.btree_id, old_key.level, new_key.pos(), new_key.pos()));
            self.shared.cache.insert(new_node_key, shim);
            self.shared.cache.remove(&old_key);
            self.shared.cache.insert(new_node_key, b.clone());
        }
        let update = self.start_update(old_key.btree_id, 0, ReserveClass::None)?;
        self.insert_node(parent, &[new_key], &update)?;
        self.enqueue_publish(update.clone());
        self.finish(update);
        Ok(())
    }

    /// Allocate a fresh, empty root, for filesystem bringup.
    pub fn root_alloc(&self, btree_id: BtreeId, level: u32) -> Result<NodeHandle> {
        let update = self.start_update(btree_id, 1, ReserveClass::None)?;
        let node = constructor::root_alloc(btree_id, level);
        let handle = self.take_prealloc(&update);
        *handle.content.lock_intent().upgrade_to_write() = node;
        update.add_new_node(handle.clone());
        self.set_root(&update, handle.clone());
        self.publish_new_nodes(&update, &[handle.clone()]);
        self.enqueue_publish(update.clone());
        self.finish(update);
        Ok(handle)
    }

    /// The current root for `btree_id`, as recovered or last set.
    pub fn root_for_read(&self, btree_id: BtreeId) -> Option<NodeHandle> {
        self.shared.roots.get(btree_id)
    }

    /// Install a root reconstructed from replaying journaled root entries
    /// at startup.
    pub fn recover_root(&self, btree_id: BtreeId, node: NodeHandle) {
        self.shared.roots.recover(btree_id, node.clone());
        self.shared.cache.set_root(btree_id, node);
    }

    /// A debug dump of in-flight updates.
    pub fn updates_to_text(&self) -> String {
        let lists = self.shared.lists.lock();
        lists
            .all_updates
            .iter()
            .map(|u| format!("update {} btree={}", u.id.0, u.btree_id.0))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of updates not yet torn down.
    pub fn nr_pending(&self) -> usize {
        self.shared.lists.lock().all_updates.len()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            drop(std::mem::replace(&mut self.publish_tx, crossbeam_channel::unbounded().0));
            let _ = handle.join();
        }
    }
}

/// The publication worker's pass over one update: append its journal
/// entries, unlink it from whatever parent it published into, and let
/// `finish` (back on the caller's thread, after the ack) release its
/// resources.
fn publish_pass(shared: &Shared, update: &Arc<Update>) {
    let (entries, pin, mode_is_node) = {
        let linkage = update.linkage.lock();
        let mode_is_node = matches!(linkage.mode, Mode::UpdatingNode(_));
        (linkage.journal_entries.clone(), linkage.journal_pin, mode_is_node)
    };
    if let Some(pin) = pin {
        let _ = shared.journal.append(pin, &entries);
    }

    if mode_is_node {
        let parent = {
            let linkage = update.linkage.lock();
            match &linkage.mode {
                Mode::UpdatingNode(p) => Some(p.clone()),
                _ => None,
            }
        };
        if let Some(parent) = parent {
            let mut tracking = parent.tracking.lock();
            tracking.write_blocked.retain(|u| u.id != update.id);
        }
    }

    {
        let mut lists = shared.lists.lock();
        lists.unwritten.retain(|id| *id != update.id);
    }
    update.nodes_written.store(true, std::sync::atomic::Ordering::Release);
}
