//! A One-Byte Spin Mutex
//!
//! Lightweight non-recursive spin mutex with strict size guarantees: the
//! companion primitive of the delay pipeline for callers who need to guard
//! fine-grained metadata next to RCU-protected data.
//!
//! Like all spin mutexes, this is almost certainly not what you want: a
//! thread seeking the lock busy-waits without doing useful work and without
//! yielding so another thread can make progress. In most cases the need for
//! locking this fine-grained hints that deferred reclamation (the rest of
//! this crate) should protect the data instead. The niche it does serve is
//! reusing spare bytes inside an existing structure, or code that cannot
//! tolerate a system-level wait.
//!
//! # Guarantees
//!
//! These must be weakened under no circumstances:
//! - The size of the type is at most one byte.
//! - Only true atomic operations are used; there is no fallback to a
//!   system-level locking mechanism.
//! - [`lock`](RawSpinMutex::lock) busy-waits without yielding.
//! - The type is trivially destructible (no [`Drop`] impl).

use core::sync::atomic::{AtomicBool, Ordering};

/// Non-recursive one-byte spin mutex.
///
/// # Example
///
/// ```rust
/// use grace_alloc::RawSpinMutex;
///
/// static LOCK: RawSpinMutex = RawSpinMutex::new();
///
/// LOCK.lock();
/// // ... critical section ...
/// unsafe { LOCK.unlock() };
/// ```
pub struct RawSpinMutex {
    locked: AtomicBool,
}

impl RawSpinMutex {
    /// Creates an unlocked mutex.
    #[inline]
    pub const fn new() -> Self {
        RawSpinMutex {
            locked: AtomicBool::new(false),
        }
    }

    /// Tries to acquire the mutex, returning whether it succeeded.
    ///
    /// If the mutex is already locked this returns `false` immediately
    /// without blocking; use [`lock`](Self::lock) to block instead.
    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    /// Blocks until the calling thread acquires the mutex.
    ///
    /// Busy-waits with no back-off or yield policy. Calling this while the
    /// current thread already owns the mutex deadlocks: the mutex is not
    /// recursive.
    #[inline]
    pub fn lock(&self) {
        while !self.try_lock() {
            core::hint::spin_loop();
        }
    }

    /// Unlocks the mutex.
    ///
    /// # Safety
    ///
    /// The calling thread must own the mutex.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for RawSpinMutex {
    fn default() -> Self {
        Self::new()
    }
}
