//! Shared, lockable per-destination state.
//!
//! Connections checked out of the pool keep only a weak handle to their manager, so a
//! manager dropped by the pool does not outlive it through stray connections.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::DebugLiteral;

/// Reference-counted, mutex-protected data.
pub(crate) struct ArcMutex<T>(Arc<Mutex<T>>);

impl<T> fmt::Debug for ArcMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArcMutex")
            .field(&DebugLiteral("..."))
            .finish()
    }
}

impl<T> Clone for ArcMutex<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> ArcMutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub(crate) fn lock(&self) -> ArcMutexGuard<T> {
        ArcMutexGuard(self.0.lock_arc())
    }

    pub(crate) fn downgrade(&self) -> WeakMutex<T> {
        WeakMutex(Arc::downgrade(&self.0))
    }
}

/// Weak reference to an [`ArcMutex`].
pub(crate) struct WeakMutex<T>(Weak<Mutex<T>>);

impl<T> fmt::Debug for WeakMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.strong_count() > 0 {
            "live"
        } else {
            "dropped"
        };
        f.debug_tuple("WeakMutex").field(&DebugLiteral(state)).finish()
    }
}

impl<T> Clone for WeakMutex<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> WeakMutex<T> {
    /// Lock the target, if it still exists.
    pub(crate) fn lock(&self) -> Option<ArcMutexGuard<T>> {
        self.0.upgrade().map(|inner| ArcMutexGuard(inner.lock_arc()))
    }
}

/// Guard providing mutable access to the value inside an [`ArcMutex`].
pub(crate) struct ArcMutexGuard<T>(parking_lot::ArcMutexGuard<parking_lot::RawMutex, T>);

impl<T> ArcMutexGuard<T> {
    /// A weak handle to the locked mutex.
    pub(crate) fn downgrade(&self) -> WeakMutex<T> {
        WeakMutex(Arc::downgrade(parking_lot::ArcMutexGuard::mutex(&self.0)))
    }
}

impl<T> Deref for ArcMutexGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for ArcMutexGuard<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
