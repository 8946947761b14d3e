//! Grace Alloc: Deferred Reclamation Through a Timed Delay Pipeline
//!
//! This crate implements an allocator adaptor that postpones object
//! destruction and storage deallocation until a user-configured *timeout*
//! has elapsed since deallocation was requested.
//!
//! # Motivation
//!
//! When modifying shared data that is concurrently read by other threads, it
//! is sometimes necessary to delay destructive operations until no reader may
//! still be using the data. This pattern is known as read-copy-update (RCU).
//! In the general case, knowing when every previous reader has released its
//! reference is the hard part. However, when readers are known to hold on to
//! shared data for no longer than a bounded time window, RCU simplifies
//! dramatically: it suffices to wait out that window (the *grace period*)
//! before reclaiming. This crate implements exactly that variant:
//!
//! ```text
//! ∀ entry: reclaim(entry) − retire(entry) > timeout
//! ```
//!
//! The trade-off is that memory is never reclaimed sooner than the timeout,
//! even when no reader holds a reference.
//!
//! # Architecture
//!
//! The system is organized into four modules:
//! - [`raw`]: the [`RawAlloc`] seam to the wrapped, underlying allocator,
//!   including support for non-raw pointer flavors (offset handles)
//! - [`deferred`]: the [`DeferredAlloc`] adaptor and its purge protocol
//! - `delay` (internal): the fixed-capacity delay buffer and the intrusive
//!   FIFO delay list of sealed buffers
//! - [`spin`]: a one-byte spin mutex companion primitive
//!
//! Data flow on retirement:
//!
//! ```text
//! retire(p, n) ──▶ current buffer ──(full)──▶ sealed + timestamped
//!                                                   │
//!                                                   ▼
//!                                        tail of the delay list
//!                                                   │
//!                  purge: now > timestamp + timeout │
//!                                                   ▼
//!                              destroy each object, deallocate each entry,
//!                              then free or recycle the carrier buffer
//! ```
//!
//! # Performance Characteristics
//!
//! - `retire`: O(1) amortized; one clock read per sealed buffer
//! - Opportunistic purge: O(expired entries)
//! - Steady-state carriers in flight: ⌈arrival_rate × timeout / capacity⌉ + 1
//!
//! # Example
//!
//! ```rust
//! use grace_alloc::{DeferredAlloc, PurgeMode, System};
//! use std::time::Duration;
//!
//! let timeout = Duration::from_millis(2);
//! let mut alloc: DeferredAlloc<String> =
//!     DeferredAlloc::with_capacity(System, timeout, 1);
//!
//! let p = alloc.allocate(1).unwrap();
//! unsafe { alloc.construct(p, 0, String::from("shared")) };
//!
//! // Readers may still hold references obtained before this point, so the
//! // object is only queued for reclamation; nothing is destroyed yet.
//! alloc.destroy(p);
//! unsafe { alloc.retire(p, 1) };
//!
//! std::thread::sleep(timeout * 2);
//! alloc.purge(PurgeMode::Opportunistic); // grace period elapsed: reclaimed
//! ```
//!
//! # Thread Safety
//!
//! A `DeferredAlloc` instance is **not** thread-safe; callers serialize
//! operations on it (every operation takes `&mut self`). The guarantee it
//! provides is what makes concurrent readers of the *allocated objects* safe
//! without locks: reclaimed storage outlives any reader that obtained a
//! reference before retirement by at least the timeout.
//!
//! # Feature Flags
//!
//! - `statistics`: per-instance pipeline counters (sealed, recycled,
//!   reclaimed, recovered)
//!
//! # References
//!
//! - McKenney et al. "RCU: Usage and Correctness." Linux Weekly News, 2007.
//! - Hart et al. "Making Lockless Synchronization Fast." ACM TOCS, 2007.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod clock;
mod delay;

pub mod deferred;
pub mod raw;
pub mod spin;

pub use deferred::{DeferredAlloc, PurgeMode};
pub use raw::{RawAlloc, System};
pub use spin::RawSpinMutex;

#[cfg(feature = "statistics")]
pub use deferred::PipelineStats;

/// Error types for the grace-alloc crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The underlying allocator refused an allocation
    AllocationFailed,
    /// A buffer byte-size computation overflowed `usize`
    LayoutOverflow,
    /// The delay buffer capacity was configured as zero
    CapacityZero,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::AllocationFailed => write!(f, "underlying allocator refused the allocation"),
            Error::LayoutOverflow => write!(f, "delay buffer layout overflows usize"),
            Error::CapacityZero => write!(f, "delay buffer capacity must be at least 1"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for grace-alloc operations
pub type Result<T> = core::result::Result<T, Error>;

/// Compile-time configuration constants
pub mod config {
    /// Default number of entries a single delay buffer holds.
    ///
    /// A larger buffer coarsens the granularity of the timeout but amortizes
    /// both delay-list insertions and reclamation passes over more entries.
    pub const DEFAULT_DELAY_BUFFER_CAPACITY: usize = 100;
}
