//! Pre-allocated node reserve pool.
//!
//! An update that is itself freeing space (e.g. a merge, or a split
//! triggered by GC) must never be the thing that blocks on disk space to
//! get the new nodes it needs; the reserve pool keeps a small cache of
//! pre-allocated, pre-formatted nodes for exactly this case.
use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::node::{Node, NodeCell, NodeHandle};
use parking_lot::{Condvar, Mutex};

/// Which reserve an allocation draws from. `nr_reserve` in [`EngineConfig`]
/// is keyed on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveClass {
    /// No reserve: allocation may use the full free-node cache and may
    /// itself block waiting for disk space.
    None,
    /// A plain btree operation (split/merge replacement node): may dip
    /// into the reserve, but leaves half of it for reserve-class callers.
    Btree,
    /// An update that is itself part of freeing space (background GC);
    /// must not block on the reserve at all.
    Alloc,
}

struct Inner {
    free_nodes: Vec<NodeHandle>,
    /// Set while one update holds the cannibalize lock, i.e. is allowed to
    /// steal nodes back out of the cache under memory/disk pressure.
    cannibalize_holder: bool,
}

/// Pool of pre-allocated interior nodes plus the cannibalize lock that
/// lets one caller at a time reclaim cached nodes under pressure.
pub struct NodeReservePool {
    inner: Mutex<Inner>,
    cannibalize_free: Condvar,
    target_size: usize,
}

impl NodeReservePool {
    pub fn new(config: &EngineConfig) -> Self {
        NodeReservePool {
            inner: Mutex::new(Inner {
                free_nodes: Vec::with_capacity(config.free_node_cache_size),
                cannibalize_holder: false,
            }),
            cannibalize_free: Condvar::new(),
            target_size: config.free_node_cache_size,
        }
    }

    /// Take a node out of the free-node cache if one is available and the
    /// reserve class permits it given how many remain.
    pub fn reserve_get(&self, class: ReserveClass, nr_reserve: usize) -> Option<NodeHandle> {
        let mut inner = self.inner.lock();
        match class {
            ReserveClass::Alloc if inner.free_nodes.len() <= nr_reserve => None,
            _ => inner.free_nodes.pop(),
        }
    }

    /// Return a pre-allocated, not-yet-used node to the cache, unless it's
    /// already full, in which case the caller should free it for real.
    pub fn reserve_put(&self, node: NodeHandle) -> Option<NodeHandle> {
        let mut inner = self.inner.lock();
        if inner.free_nodes.len() < self.target_size {
            inner.free_nodes.push(node);
            None
        } else {
            Some(node)
        }
    }

    /// Block until the cannibalize lock is free, then take it. While
    /// held, the caller may evict cached nodes via [`Self::cannibalize`].
    pub fn cannibalize_lock(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.cannibalize_holder {
            return Err(Error::from(ErrorKind::Again));
        }
        inner.cannibalize_holder = true;
        Ok(())
    }

    pub fn cannibalize_unlock(&self) {
        let mut inner = self.inner.lock();
        inner.cannibalize_holder = false;
        self.cannibalize_free.notify_one();
    }

    /// Pull every node currently in the cache, for the cannibalize-lock
    /// holder to reuse.
    pub fn cannibalize(&self) -> Vec<NodeHandle> {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.free_nodes)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().free_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[allow(unused)]
fn _assert_node_used(_: &Node) {}
