//! Pluggable lock discipline for the arena.
//!
//! The arena's shared state is guarded by a single exclusive lock, but the
//! lock *primitive* is an injected capability: production embeddings use
//! [`SyncLock`] (a real mutex), single-threaded embeddings and unit tests can
//! substitute [`UnsyncLock`] with the identical call shape and zero
//! synchronization cost. Because `UnsyncLock` is built on `RefCell` it is not
//! `Sync`, so sharing it across threads is a compile error rather than a
//! data race.

use std::cell::{RefCell, RefMut};
use std::ops::DerefMut;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::error::AllocError;

/// Errors produced while acquiring a lock policy's guard.
#[derive(Error, Debug)]
pub enum LockError {
    /// A previous holder panicked while the lock was held.
    #[error("lock poisoned: {0}")]
    Poisoned(String),

    /// The lock is already held on this thread (reentrant use of an
    /// unsynchronized policy).
    #[error("lock already held: {0}")]
    Reentrant(String),
}

impl From<LockError> for AllocError {
    fn from(err: LockError) -> Self {
        AllocError::LockPoisoned(err.to_string())
    }
}

/// A mutual-exclusion capability with scoped-guard semantics.
///
/// Acquiring yields a guard that dereferences to the protected value; the
/// lock is released when the guard drops, on every exit path.
pub trait LockPolicy<T> {
    /// The scoped guard type.
    type Guard<'a>: DerefMut<Target = T>
    where
        Self: 'a;

    /// Wrap a value in this lock.
    fn new(value: T) -> Self;

    /// Acquire the guard, blocking on contention where the policy blocks
    /// at all.
    fn lock(&self) -> Result<Self::Guard<'_>, LockError>;

    /// Consume the lock and return the protected value.
    fn into_inner(self) -> Result<T, LockError>;
}

/// Mutex-backed policy for shared, multi-threaded use.
///
/// Poisoning is surfaced as an error, never ignored: a panic mid-mutation
/// may have left the protected state inconsistent.
#[derive(Debug)]
pub struct SyncLock<T> {
    inner: Mutex<T>,
}

impl<T> LockPolicy<T> for SyncLock<T> {
    type Guard<'a>
        = MutexGuard<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        SyncLock {
            inner: Mutex::new(value),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, T>, LockError> {
        self.inner
            .lock()
            .map_err(|e| LockError::Poisoned(e.to_string()))
    }

    fn into_inner(self) -> Result<T, LockError> {
        self.inner
            .into_inner()
            .map_err(|e| LockError::Poisoned(e.to_string()))
    }
}

/// RefCell-backed policy for single-threaded embeddings and tests.
///
/// Same call shape as [`SyncLock`], no synchronization. Not `Sync`.
#[derive(Debug)]
pub struct UnsyncLock<T> {
    inner: RefCell<T>,
}

impl<T> LockPolicy<T> for UnsyncLock<T> {
    type Guard<'a>
        = RefMut<'a, T>
    where
        Self: 'a;

    fn new(value: T) -> Self {
        UnsyncLock {
            inner: RefCell::new(value),
        }
    }

    fn lock(&self) -> Result<RefMut<'_, T>, LockError> {
        self.inner
            .try_borrow_mut()
            .map_err(|e| LockError::Reentrant(e.to_string()))
    }

    fn into_inner(self) -> Result<T, LockError> {
        Ok(self.inner.into_inner())
    }
}
