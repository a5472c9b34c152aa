//! Mutual exclusion with a non-blocking acquire, shared through `Arc`.
//!
//! [`TryLock`] is the lock guarding the pool's destination map. It offers a blocking
//! [`TryLock::lock`] and an immediate [`TryLock::try_lock`]; releasing the lock is
//! dropping the returned guard. [`WeakLock`] is the non-owning side, used by records and
//! checkouts that must not keep the pool alive.

use std::fmt;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use parking_lot::RawMutex;

use crate::DebugLiteral;

/// Reference-counted lock around a value.
pub(crate) struct TryLock<T>(Arc<Mutex<T>>);

impl<T> TryLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    /// Block the current thread until the lock is held.
    pub(crate) fn lock(&self) -> TryLockGuard<T> {
        TryLockGuard(self.0.lock_arc())
    }

    /// Acquire the lock only if nobody else holds it right now.
    pub(crate) fn try_lock(&self) -> Option<TryLockGuard<T>> {
        self.0.try_lock_arc().map(TryLockGuard)
    }

    pub(crate) fn downgrade(&self) -> WeakLock<T> {
        WeakLock(Some(Arc::downgrade(&self.0)))
    }
}

impl<T> Clone for TryLock<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: fmt::Debug> fmt::Debug for TryLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_tuple("TryLock").field(&*guard).finish(),
            None => f
                .debug_tuple("TryLock")
                .field(&DebugLiteral("<locked>"))
                .finish(),
        }
    }
}

/// Non-owning handle to a [`TryLock`].
///
/// Both acquire methods return `None` once every [`TryLock`] handle has been dropped.
pub(crate) struct WeakLock<T>(Option<Weak<Mutex<T>>>);

impl<T> WeakLock<T> {
    /// A handle which never refers to a lock.
    pub(crate) fn none() -> Self {
        Self(None)
    }

    pub(crate) fn lock(&self) -> Option<TryLockGuard<T>> {
        self.upgrade().map(|inner| TryLockGuard(inner.lock_arc()))
    }

    #[cfg(test)]
    pub(crate) fn try_lock(&self) -> Option<TryLockGuard<T>> {
        self.upgrade()
            .and_then(|inner| inner.try_lock_arc().map(TryLockGuard))
    }

    #[cfg(test)]
    pub(crate) fn is_none(&self) -> bool {
        self.upgrade().is_none()
    }

    fn upgrade(&self) -> Option<Arc<Mutex<T>>> {
        self.0.as_ref().and_then(Weak::upgrade)
    }
}

impl<T> Clone for WeakLock<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for WeakLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.0 {
            Some(weak) if weak.strong_count() > 0 => "Some(...)",
            Some(_) => "Dropped",
            None => "None",
        };
        f.debug_tuple("WeakLock")
            .field(&DebugLiteral(state))
            .finish()
    }
}

/// Exclusive access to the value inside a [`TryLock`]. Dropping the guard unlocks.
pub(crate) struct TryLockGuard<T>(parking_lot::ArcMutexGuard<RawMutex, T>);

impl<T> Deref for TryLockGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for TryLockGuard<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> fmt::Debug for TryLockGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TryLockGuard").finish()
    }
}
