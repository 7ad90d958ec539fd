//! Journal collaborator.
//!
//! The production journal (space reservation, pins, replay, checksumming)
//! is out of scope; this module defines the seam the engine needs
//! (pre-reservation, pins, entry append) as a trait, plus a small in-memory
//! implementation good enough to drive and test the engine end to end.
use crate::bkey::BKey;
use crate::error::{Error, ErrorKind, Result};
use crate::pos::BtreeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A reservation of journal space for one update's worth of entries,
/// acquired before any node is modified so the update can always log what
/// it did.
#[derive(Debug)]
pub struct JournalPreReservation {
    pub units: u32,
}

/// A pin keeps the journal from reclaiming the sequence number it was
/// taken at until dropped/transferred. Updates take one when they start
/// and transfer it to whichever following update is oldest, so the
/// journal's flush horizon only ever advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalPin {
    pub seq: u64,
}

/// What an update logs before it is allowed to touch node content, so a
/// crash after partial writes can still be replayed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JournalEntry {
    BtreeKeys {
        btree_id: BtreeId,
        level: u32,
        key: BKey,
    },
    BtreeRoot {
        btree_id: BtreeId,
        level: u32,
        key: Option<BKey>,
    },
}

pub trait Journal: Send + Sync {
    /// Reserve `units` words of journal space, failing with
    /// `ErrorKind::JournalFull` if the journal has no room. The caller
    /// should back off and retry; this is not fatal.
    fn preres_get(&self, units: u32) -> Result<JournalPreReservation>;
    fn preres_put(&self, res: JournalPreReservation);

    /// Pin the journal at its current sequence number.
    fn add_pin(&self) -> JournalPin;
    /// Return whichever of `a`/`b` is older (lower `seq`); used when
    /// reparenting transfers a pin to the update that should hold it.
    fn pin_copy_oldest(&self, a: JournalPin, b: JournalPin) -> JournalPin {
        if a.seq <= b.seq {
            a
        } else {
            b
        }
    }
    fn pin_drop(&self, pin: JournalPin);

    /// Append entries under the pinned sequence number. Entries for a
    /// given update must all land in the same journal write, or in order
    /// if split across writes, so replay reconstructs topology changes in
    /// the order they were made.
    fn append(&self, pin: JournalPin, entries: &[JournalEntry]) -> Result<()>;

    fn is_errored(&self) -> bool;
}

/// In-memory reference journal: entries are appended to a log keyed by
/// pin sequence number; pins are refcounted so `pin_drop` can detect when
/// a sequence number is fully released.
pub struct InMemoryJournal {
    next_seq: AtomicU64,
    capacity_units: u32,
    reserved_units: Mutex<u32>,
    log: Mutex<BTreeMap<u64, Vec<JournalEntry>>>,
    pin_refs: Mutex<BTreeMap<u64, u32>>,
    errored: std::sync::atomic::AtomicBool,
}

impl InMemoryJournal {
    pub fn new(capacity_units: u32) -> Self {
        InMemoryJournal {
            next_seq: AtomicU64::new(1),
            capacity_units,
            errored: std::sync::atomic::AtomicBool::new(false),
            reserved_units: Mutex::new(0),
            log: Mutex::new(BTreeMap::new()),
            pin_refs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Test/debug helper: all entries logged under `seq`, oldest first.
    pub fn entries_at(&self, seq: u64) -> Vec<JournalEntry> {
        self.log.lock().get(&seq).cloned().unwrap_or_default()
    }

    pub fn oldest_pinned_seq(&self) -> Option<u64> {
        self.pin_refs.lock().keys().next().copied()
    }
}

impl Journal for InMemoryJournal {
    fn preres_get(&self, units: u32) -> Result<JournalPreReservation> {
        let mut reserved = self.reserved_units.lock();
        if *reserved + units > self.capacity_units {
            return Err(Error::from(ErrorKind::JournalFull));
        }
        *reserved += units;
        Ok(JournalPreReservation { units })
    }

    fn preres_put(&self, res: JournalPreReservation) {
        let mut reserved = self.reserved_units.lock();
        *reserved = reserved.saturating_sub(res.units);
    }

    fn add_pin(&self) -> JournalPin {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        *self.pin_refs.lock().entry(seq).or_insert(0) += 1;
        JournalPin { seq }
    }

    fn pin_drop(&self, pin: JournalPin) {
        let mut refs = self.pin_refs.lock();
        if let Some(count) = refs.get_mut(&pin.seq) {
            *count -= 1;
            if *count == 0 {
                refs.remove(&pin.seq);
            }
        }
    }

    fn append(&self, pin: JournalPin, entries: &[JournalEntry]) -> Result<()> {
        self.log
            .lock()
            .entry(pin.seq)
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Relaxed)
    }
}

impl InMemoryJournal {
    /// Test/fault-injection hook: put the journal into its fatal error
    /// state. Topology operations that start afterward short-circuit with
    /// `ErrorKind::JournalError`.
    pub fn inject_error(&self) {
        self.errored.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preres_get_fails_once_capacity_exhausted() {
        let journal = InMemoryJournal::new(10);
        assert!(journal.preres_get(10).is_ok());
        assert!(matches!(journal.preres_get(1), Err(e) if matches!(e.kind(), ErrorKind::JournalFull)));
    }

    #[test]
    fn preres_put_frees_capacity() {
        let journal = InMemoryJournal::new(10);
        let res = journal.preres_get(10).unwrap();
        journal.preres_put(res);
        assert!(journal.preres_get(10).is_ok());
    }

    #[test]
    fn pin_copy_oldest_picks_lower_seq() {
        let journal = InMemoryJournal::new(10);
        let a = journal.add_pin();
        let b = journal.add_pin();
        assert_eq!(journal.pin_copy_oldest(a, b), a);
        assert_eq!(journal.pin_copy_oldest(b, a), a);
    }

    #[test]
    fn append_is_visible_under_its_pin() {
        let journal = InMemoryJournal::new(10);
        let pin = journal.add_pin();
        let key = crate::bkey::BKey::Whiteout { pos: crate::pos::Pos(1) };
        journal
            .append(
                pin,
                &[JournalEntry::BtreeKeys {
                    btree_id: BtreeId(1),
                    level: 0,
                    key,
                }],
            )
            .unwrap();
        assert_eq!(journal.entries_at(pin.seq).len(), 1);
    }
}
