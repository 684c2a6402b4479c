#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

/// Latch combining a reader/writer lock with a version counter.
///
/// Every exclusive section bumps the version when it ends, so a reader that
/// copied bytes without blocking can later check whether a writer intervened.
pub struct HybridLatch<T> {
    version: Arc<AtomicU64>,
    lock: Arc<RwLock<T>>,
}

/// Raised when an optimistic attempt must start over.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Restart;

impl<T> HybridLatch<T> {
    /// Wraps `value` in a new latch at version 0.
    pub fn new(value: T) -> Self {
        Self {
            version: Arc::new(AtomicU64::new(0)),
            lock: Arc::new(RwLock::new(value)),
        }
    }

    /// Current version; increases after every exclusive section.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Non-blocking read attempt. Fails with [`Restart`] while a writer holds the latch.
    pub fn optimistic(&self) -> Result<OptimisticGuard<T>, Restart> {
        let guard = self.lock.try_read_arc().ok_or(Restart)?;
        Ok(OptimisticGuard {
            version: self.version(),
            guard,
        })
    }

    /// Blocking shared access.
    pub fn shared(&self) -> SharedGuard<T> {
        SharedGuard {
            guard: self.lock.read_arc(),
        }
    }

    /// Blocking exclusive access.
    pub fn exclusive(&self) -> ExclusiveGuard<T> {
        let guard = self.lock.write_arc();
        ExclusiveGuard {
            version: Arc::clone(&self.version),
            guard,
        }
    }

    /// Checks `token` against the current version.
    pub fn validate(&self, token: VersionToken) -> Result<(), Restart> {
        if self.version() == token.0 {
            Ok(())
        } else {
            Err(Restart)
        }
    }
}

/// Version observed by an optimistic reader, validated after the latch is released.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VersionToken(pub u64);

/// Read access obtained without blocking.
pub struct OptimisticGuard<T> {
    version: u64,
    guard: ArcRwLockReadGuard<RawRwLock, T>,
}

impl<T> OptimisticGuard<T> {
    /// Releases the latch, keeping the version for later validation.
    pub fn release(self) -> VersionToken {
        VersionToken(self.version)
    }
}

impl<T> std::ops::Deref for OptimisticGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Shared access to the latched value.
pub struct SharedGuard<T> {
    guard: ArcRwLockReadGuard<RawRwLock, T>,
}

impl<T> std::ops::Deref for SharedGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive access; bumps the latch version on drop.
pub struct ExclusiveGuard<T> {
    version: Arc<AtomicU64>,
    guard: ArcRwLockWriteGuard<RawRwLock, T>,
}

impl<T> ExclusiveGuard<T> {
    /// The version readers will observe once this guard is released.
    pub fn version_after_release(&self) -> u64 {
        self.version.load(Ordering::Acquire) + 1
    }
}

impl<T> std::ops::Deref for ExclusiveGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for ExclusiveGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ExclusiveGuard<T> {
    fn drop(&mut self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}
