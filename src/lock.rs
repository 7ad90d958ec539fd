//! Six-state node lock.
//!
//! A node's lock has six observable states (none/read/intent/write and
//! their "held with pending upgrade" variants). This module gives a
//! small, correct `parking_lot`-backed implementation:
//!
//! - any number of readers may hold the lock concurrently ([`SixLock::read`]);
//! - at most one thread may hold *intent* at a time ([`SixLock::lock_intent`]),
//!   and intent may coexist with readers;
//! - *write* may only be acquired while holding intent, and excludes readers
//!   ([`IntentGuard::upgrade_to_write`]); it is meant to be held only across a
//!   single bset mutation.
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::{Deref, DerefMut};

pub struct SixLock<T> {
    inner: RwLock<T>,
    intent_held: Mutex<bool>,
    intent_free: Condvar,
}

impl<T> SixLock<T> {
    pub fn new(value: T) -> Self {
        SixLock {
            inner: RwLock::new(value),
            intent_held: Mutex::new(false),
            intent_free: Condvar::new(),
        }
    }

    /// Acquire a read lock. Coexists with intent, excluded by write.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.inner.try_read()
    }

    /// Acquire the single intent slot, blocking until it is free. Intent is
    /// an upgrade reservation: readers may still come and go underneath it.
    pub fn lock_intent(&self) -> IntentGuard<'_, T> {
        let mut held = self.intent_held.lock();
        while *held {
            self.intent_free.wait(&mut held);
        }
        *held = true;
        IntentGuard { lock: self }
    }

    pub fn try_lock_intent(&self) -> Option<IntentGuard<'_, T>> {
        let mut held = self.intent_held.lock();
        if *held {
            None
        } else {
            *held = true;
            Some(IntentGuard { lock: self })
        }
    }
}

/// Holds the single intent slot for a [`SixLock`]. Dropping releases it.
pub struct IntentGuard<'a, T> {
    lock: &'a SixLock<T>,
}

impl<'a, T> IntentGuard<'a, T> {
    /// Upgrade to a write lock, blocking until all readers have drained.
    /// Hold this only across a single bset mutation.
    pub fn upgrade_to_write(&self) -> RwLockWriteGuard<'a, T> {
        self.lock.inner.write()
    }

    pub fn read(&self) -> RwLockReadGuard<'a, T> {
        self.lock.inner.read()
    }
}

impl<'a, T> Drop for IntentGuard<'a, T> {
    fn drop(&mut self) {
        let mut held = self.lock.intent_held.lock();
        *held = false;
        self.lock.intent_free.notify_one();
    }
}

/// A read guard that also asserts the author held intent first, used where
/// call sites want to document "intent held, now reading" without actually
/// taking a second lock.
pub struct IntentRead<'a, T> {
    guard: RwLockReadGuard<'a, T>,
}

impl<'a, T> Deref for IntentRead<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> From<RwLockReadGuard<'a, T>> for IntentRead<'a, T> {
    fn from(guard: RwLockReadGuard<'a, T>) -> Self {
        IntentRead { guard }
    }
}

/// Convenience alias; call sites that need a mutable view already hold
/// intent and have upgraded to write.
pub type WriteGuard<'a, T> = RwLockWriteGuard<'a, T>;

#[allow(unused)]
fn _assert_deref<T>(g: RwLockWriteGuard<'_, T>) -> &T {
    g.deref()
}
#[allow(unused)]
fn _assert_deref_mut<T>(mut g: RwLockWriteGuard<'_, T>) -> &mut T {
    g.deref_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_coexist() {
        let lock = SixLock::new(1);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 1);
        assert_eq!(*b, 1);
    }

    #[test]
    fn intent_is_exclusive() {
        let lock = SixLock::new(1);
        let intent = lock.try_lock_intent();
        assert!(intent.is_some());
        assert!(lock.try_lock_intent().is_none());
        drop(intent);
        assert!(lock.try_lock_intent().is_some());
    }

    #[test]
    fn intent_coexists_with_reads() {
        let lock = SixLock::new(1);
        let _reader = lock.read();
        assert!(lock.try_lock_intent().is_some());
    }

    #[test]
    fn upgrade_to_write_mutates_through() {
        let lock = SixLock::new(1);
        {
            let intent = lock.lock_intent();
            let mut write = intent.upgrade_to_write();
            *write = 42;
        }
        assert_eq!(*lock.read(), 42);
    }
}
