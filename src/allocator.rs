//! Allocator collaborator.
//!
//! Multi-device bucket accounting, replication placement and background
//! reclaim are out of scope; this module defines the seam the engine
//! needs (disk space reservation, node extent allocation, open-bucket
//! pins) plus a trivial in-memory implementation for testing.
use crate::bkey::NodeLocator;
use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reserved disk space for one node write, released (not necessarily
/// consumed) when the write completes or is abandoned.
#[derive(Debug)]
pub struct DiskReservation {
    pub bytes: u64,
}

/// Pins an open bucket so the allocator won't hand its remaining space to
/// someone else while a node write targeting it is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenBucket {
    pub id: u64,
}

pub trait Allocator: Send + Sync {
    /// Reserve space for a node write of `bytes`, failing with
    /// `ErrorKind::NoSpace` if the device set is full. Retryable by the
    /// caller after freeing something; not fatal.
    fn reserve_disk_space(&self, bytes: u64) -> Result<DiskReservation>;
    fn release_disk_reservation(&self, res: DiskReservation);

    /// Allocate a backing extent for a new node, returning its locator and
    /// the open bucket(s) pinning it.
    fn alloc_node_extent(&self, replicas: u8) -> Result<(NodeLocator, Vec<OpenBucket>)>;
    fn open_bucket_put(&self, bucket: OpenBucket);
}

/// In-memory reference allocator: a single fake device, extents handed
/// out by bumping a counter, no real space accounting beyond the
/// reservation bytes ever being double-spent.
pub struct InMemoryAllocator {
    capacity_bytes: u64,
    used_bytes: Mutex<u64>,
    next_offset: AtomicU64,
    next_bucket: AtomicU64,
}

impl InMemoryAllocator {
    pub fn new(capacity_bytes: u64) -> Self {
        InMemoryAllocator {
            capacity_bytes,
            used_bytes: Mutex::new(0),
            next_offset: AtomicU64::new(0),
            next_bucket: AtomicU64::new(1),
        }
    }
}

impl Allocator for InMemoryAllocator {
    fn reserve_disk_space(&self, bytes: u64) -> Result<DiskReservation> {
        let mut used = self.used_bytes.lock();
        if *used + bytes > self.capacity_bytes {
            return Err(Error::from(ErrorKind::NoSpace));
        }
        *used += bytes;
        Ok(DiskReservation { bytes })
    }

    fn release_disk_reservation(&self, res: DiskReservation) {
        let mut used = self.used_bytes.lock();
        *used = used.saturating_sub(res.bytes);
    }

    fn alloc_node_extent(&self, replicas: u8) -> Result<(NodeLocator, Vec<OpenBucket>)> {
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
        let mut buckets = Vec::with_capacity(replicas.max(1) as usize);
        for _ in 0..replicas.max(1) {
            let id = self.next_bucket.fetch_add(1, Ordering::Relaxed);
            buckets.push(OpenBucket { id });
        }
        Ok((
            NodeLocator {
                device: 0,
                offset,
            },
            buckets,
        ))
    }

    fn open_bucket_put(&self, _bucket: OpenBucket) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_disk_space_fails_past_capacity() {
        let allocator = InMemoryAllocator::new(100);
        assert!(allocator.reserve_disk_space(100).is_ok());
        assert!(matches!(
            allocator.reserve_disk_space(1),
            Err(e) if matches!(e.kind(), ErrorKind::NoSpace)
        ));
    }

    #[test]
    fn release_disk_reservation_frees_capacity() {
        let allocator = InMemoryAllocator::new(100);
        let res = allocator.reserve_disk_space(100).unwrap();
        allocator.release_disk_reservation(res);
        assert!(allocator.reserve_disk_space(100).is_ok());
    }

    #[test]
    fn alloc_node_extent_yields_distinct_locators() {
        let allocator = InMemoryAllocator::new(1 << 20);
        let (a, _) = allocator.alloc_node_extent(1).unwrap();
        let (b, _) = allocator.alloc_node_extent(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn alloc_node_extent_returns_one_bucket_per_replica() {
        let allocator = InMemoryAllocator::new(1 << 20);
        let (_, buckets) = allocator.alloc_node_extent(3).unwrap();
        assert_eq!(buckets.len(), 3);
    }
}
