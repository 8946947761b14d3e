//! The Deferred Reclamation Adaptor
//!
//! [`DeferredAlloc`] wraps a [`RawAlloc`] and postpones object destruction
//! and storage deallocation until a configured timeout has elapsed since
//! [`retire`](DeferredAlloc::retire) was called.
//!
//! # Pipeline
//!
//! ```text
//! 1. retire(p, n) appends (p, n) to the current buffer: O(1), no clock read
//! 2. When the buffer fills it is sealed: stamped with one clock read and
//!    pushed to the tail of the delay list
//! 3. A withholding purge then reclaims every expired head; the first freed
//!    carrier is kept and becomes the new current buffer (recycling)
//! 4. If nothing was expired, a fresh carrier is allocated
//! 5. If that allocation fails, the pipeline blocks until the head's
//!    deadline, recycles it, and continues; the failure never escapes
//! ```
//!
//! # Complexity
//!
//! - `retire`: O(1) amortized; one clock read and one list push per
//!   `capacity` retirements
//! - `purge(Opportunistic)`: O(expired entries), never blocks
//! - `purge(Exhaustive)`: drains the whole list, sleeping as needed
//!
//! Once the pipeline is warm, each sealing matches a reclamation and the set
//! of in-flight carriers is bounded by
//! `ceil(arrival_rate × timeout / capacity) + 1`.

use core::fmt;
use core::marker::PhantomData;
use std::time::{Duration, Instant};

use crate::clock;
use crate::delay::buffer;
use crate::delay::{BufferLayout, DelayList, Entry};
use crate::raw::{RawAlloc, System};
use crate::{config, Error, Result};

/// Flavor of a [`purge`](DeferredAlloc::purge) pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Reclaim expired heads only; stop at the first buffer whose grace
    /// period has not elapsed. Never blocks.
    Opportunistic,
    /// Reclaim the entire delay list, sleeping until each buffer's deadline
    /// as needed. Returns only once the list is empty.
    Exhaustive,
}

/// Pipeline counters, available with the `statistics` feature.
///
/// Counters are plain integers: a `DeferredAlloc` instance is externally
/// synchronized, so there is nothing to contend on.
#[cfg(feature = "statistics")]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// Carriers obtained from the underlying allocator.
    pub buffers_allocated: u64,
    /// Carriers stamped and pushed onto the delay list.
    pub buffers_sealed: u64,
    /// Carriers reused as the current buffer instead of being freed.
    pub buffers_recycled: u64,
    /// Carriers whose bytes were returned to the underlying allocator.
    pub buffers_freed: u64,
    /// Entries destroyed and deallocated.
    pub entries_reclaimed: u64,
    /// Carrier allocation failures absorbed by the blocking recovery path.
    pub alloc_failures_recovered: u64,
}

/// Allocator adaptor that defers destruction and reclamation until a grace
/// period has elapsed.
///
/// The adaptor owns a *current buffer* accepting retirement entries and a
/// *delay list* of sealed, timestamped buffers. Storage retired through
/// [`retire`](Self::retire) is destroyed and returned to the underlying
/// allocator no sooner than `timeout` after the call. The contract is
/// *at least* the timeout, not *at most*.
///
/// # Type Parameters
///
/// - `T`: the value type this instance allocates and reclaims
/// - `A`: the underlying allocator; defaults to [`System`]
///
/// # Example
///
/// ```rust
/// use grace_alloc::{DeferredAlloc, PurgeMode, System};
/// use std::time::Duration;
///
/// let mut alloc: DeferredAlloc<u32> =
///     DeferredAlloc::with_capacity(System, Duration::from_millis(1), 1);
///
/// let p = alloc.allocate(1).unwrap();
/// unsafe { alloc.construct(p, 0, 7) };
/// unsafe { alloc.retire(p, 1) };
///
/// std::thread::sleep(Duration::from_millis(2));
/// alloc.purge(PurgeMode::Opportunistic);
/// assert_eq!(alloc.pending(), 0);
/// ```
///
/// # Thread Safety
///
/// Not thread-safe: every operation takes `&mut self`. The grace-period
/// guarantee on the *retired objects* is what lets concurrent readers of
/// those objects go lockless; the adaptor itself needs external
/// synchronization or a single owning thread.
pub struct DeferredAlloc<T, A: RawAlloc = System> {
    /// The wrapped allocator. Also serves, at byte granularity, as the
    /// source of carrier storage.
    alloc: A,

    /// Grace period between a retirement and its reclamation. Immutable.
    timeout: Duration,

    /// Cached clock reading, refreshed at sealing and at purge entry so the
    /// purge loops do not re-read the clock per buffer.
    now: Instant,

    /// Byte layout shared by every carrier of this instance.
    layout: BufferLayout,

    /// Entries per carrier. Immutable, ≥ 1.
    capacity: usize,

    /// The buffer currently accepting entries. `None` only transiently while
    /// a full buffer is being replaced; a panic in that window (from a value
    /// destructor) leaves it `None`, which `Drop` treats as poisoned.
    current: Option<A::Ptr<u8>>,

    /// Fill level of the current buffer, in `[0, capacity)` between calls.
    current_len: usize,

    /// Sealed carriers, oldest first.
    list: DelayList<A>,

    #[cfg(feature = "statistics")]
    stats: PipelineStats,

    /// The pipeline owns pending `T`s and runs their destructors.
    _marker: PhantomData<T>,
}

// SAFETY: handles are plain data owned exclusively by the pipeline. Sending
// the pipeline transfers ownership of the underlying allocator (`A: Send`)
// and of every pending object (`T: Send`, since their destructors will run
// on the receiving thread).
unsafe impl<T: Send, A: RawAlloc + Send> Send for DeferredAlloc<T, A> {}

impl<T, A: RawAlloc> DeferredAlloc<T, A> {
    /// Creates an adaptor with the given underlying allocator, timeout, and
    /// delay buffer capacity.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityZero`] if `capacity` is zero, [`Error::LayoutOverflow`]
    /// if a carrier of that capacity cannot be laid out, or
    /// [`Error::AllocationFailed`] if the initial current buffer cannot be
    /// allocated.
    pub fn try_with_capacity(alloc: A, timeout: Duration, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::CapacityZero);
        }
        let layout = BufferLayout::for_capacity::<T, A>(capacity)?;
        let now = clock::now();
        let mut alloc = alloc;
        let current = buffer::create::<T, A>(&mut alloc, layout, now)?;
        Ok(DeferredAlloc {
            alloc,
            timeout,
            now,
            layout,
            capacity,
            current: Some(current),
            current_len: 0,
            list: DelayList::new(),
            #[cfg(feature = "statistics")]
            stats: PipelineStats {
                buffers_allocated: 1,
                ..PipelineStats::default()
            },
            _marker: PhantomData,
        })
    }

    /// Creates an adaptor with the default delay buffer capacity
    /// ([`config::DEFAULT_DELAY_BUFFER_CAPACITY`]).
    pub fn try_new(alloc: A, timeout: Duration) -> Result<Self> {
        Self::try_with_capacity(alloc, timeout, config::DEFAULT_DELAY_BUFFER_CAPACITY)
    }

    /// Like [`try_new`](Self::try_new), but panics on failure.
    pub fn new(alloc: A, timeout: Duration) -> Self {
        Self::try_new(alloc, timeout).expect("failed to construct DeferredAlloc")
    }

    /// Like [`try_with_capacity`](Self::try_with_capacity), but panics on
    /// failure.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or the initial buffer allocation fails.
    pub fn with_capacity(alloc: A, timeout: Duration, capacity: usize) -> Self {
        Self::try_with_capacity(alloc, timeout, capacity)
            .expect("failed to construct DeferredAlloc")
    }

    /// The configured grace period.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Entries a single delay buffer holds.
    #[inline]
    pub fn delay_buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently awaiting reclamation, sealed or not.
    #[inline]
    pub fn pending(&self) -> usize {
        self.list.len() * self.capacity + self.current_len
    }

    /// A reference to the underlying allocator.
    #[inline]
    pub fn underlying(&self) -> &A {
        &self.alloc
    }

    /// A copy of the pipeline counters.
    #[cfg(feature = "statistics")]
    pub fn statistics(&self) -> PipelineStats {
        self.stats
    }

    /// Forwards the allocation to the underlying allocator.
    ///
    /// Storage obtained here must be fully constructed (via
    /// [`construct`](Self::construct)) before it may be retired: retirement
    /// destroys every object in the range when the grace period elapses, so
    /// retiring unconstructed storage is undefined.
    ///
    /// # Errors
    ///
    /// Underlying failures propagate unchanged.
    pub fn allocate(&mut self, count: usize) -> Result<A::Ptr<T>> {
        debug_assert!(self.current.is_some());
        self.alloc.allocate(count)
    }

    /// Constructs `value` in the `index`-th slot of `ptr` through the
    /// underlying allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this adaptor (or
    /// an equal one), `index` must be in bounds, and the slot must not hold a
    /// live object. In particular, constructing over a slot after
    /// [`destroy`](Self::destroy) is undefined: the previous object is still
    /// there.
    pub unsafe fn construct(&mut self, ptr: A::Ptr<T>, index: usize, value: T) {
        debug_assert!(self.current.is_some());
        // SAFETY: forwarded caller contract.
        unsafe { self.alloc.construct(ptr, index, value) }
    }

    /// Does nothing: destruction is deferred until reclamation.
    ///
    /// Deferring destruction is what unifies destruction and deallocation
    /// into one timed event; a "just destroy now" fast path would let a
    /// reader that still holds a reference observe a destroyed object.
    pub fn destroy(&mut self, _ptr: A::Ptr<T>) {
        debug_assert!(self.current.is_some());
    }

    /// Hands `count` objects starting at `ptr` to the delay pipeline.
    ///
    /// The objects are destroyed, and their storage returned to the
    /// underlying allocator, no sooner than [`timeout`](Self::timeout) after
    /// this call. The call itself never destroys or deallocates anything the
    /// caller handed in.
    ///
    /// # Blocking
    ///
    /// Normally non-blocking. When sealing a buffer requires a replacement
    /// and the underlying allocator refuses one, this call sleeps until the
    /// oldest sealed buffer's deadline and recycles it; the allocation
    /// failure is absorbed, never surfaced. In the worst case the wait is
    /// the full timeout.
    ///
    /// # Safety
    ///
    /// The range must come from a matching `allocate(count)` on this adaptor
    /// (or an equal one), every object in it must have been constructed, and
    /// the range must not be retired twice. The caller forfeits access to the
    /// objects, though existing readers may finish within the grace period.
    pub unsafe fn retire(&mut self, ptr: A::Ptr<T>, count: usize) {
        let current = self
            .current
            .expect("delay pipeline has no current buffer (a previous retire panicked mid-seal)");
        debug_assert!(
            self.current_len < self.capacity,
            "the current buffer is always drained below capacity before retire returns"
        );

        // SAFETY: in-bounds slot of a live carrier; the pipeline now owns
        // the retired range.
        unsafe {
            buffer::write_entry(
                &self.alloc,
                current,
                self.layout,
                self.current_len,
                Entry { ptr, count },
            );
        }
        self.current_len += 1;
        if self.current_len < self.capacity {
            return;
        }

        // Seal: one clock read serves as both the carrier's timestamp and
        // the cached `now` for the purge that follows.
        let stamp = clock::now();
        self.now = stamp;
        // SAFETY: live carrier, detached below before it joins the list.
        unsafe {
            buffer::set_timestamp(&self.alloc, current, stamp);
        }
        self.current = None;
        // SAFETY: `current` is live and not on any list.
        unsafe { self.list.push_back(&self.alloc, current) };
        #[cfg(feature = "statistics")]
        {
            self.stats.buffers_sealed += 1;
        }

        // Recycle-by-purge: an expired head hands us a carrier without
        // touching the underlying allocator at all.
        let mut replacement = self.purge_and_withhold();

        if replacement.is_none() {
            replacement = match self.new_carrier() {
                Ok(fresh) => Some(fresh),
                Err(_) => Some(self.recover_carrier()),
            };
        }

        self.current = replacement;
        self.current_len = 0;
    }

    /// Reclaims expired buffers from the head of the delay list.
    ///
    /// The current buffer is never purged: it has no meaningful timestamp
    /// until sealed, and reclaiming it early would violate the minimum
    /// grace period.
    ///
    /// With [`PurgeMode::Exhaustive`] this call blocks until the list is
    /// empty. With [`PurgeMode::Opportunistic`] it never blocks and leaves
    /// the list with a head whose deadline is still in the future, if any.
    pub fn purge(&mut self, mode: PurgeMode) {
        debug_assert!(self.current.is_some());
        self.purge_list(mode);
    }

    /// The purge loop proper, shared with `Drop` (which runs it after
    /// detaching the current buffer).
    fn purge_list(&mut self, mode: PurgeMode) {
        self.now = clock::now();
        while let Some(head) = self.list.front() {
            // SAFETY: list members are live carriers.
            let deadline = unsafe { buffer::timestamp(&self.alloc, head) } + self.timeout;

            // Strict comparison: entries live *longer than* the timeout,
            // never exactly as long.
            if self.now > deadline {
                self.list.pop_front(&self.alloc);
                // SAFETY: sealed carriers are full; `head` is unlinked.
                unsafe {
                    self.reclaim_entries(head, self.capacity);
                    self.free_carrier(head);
                }
            } else {
                match mode {
                    PurgeMode::Opportunistic => return,
                    PurgeMode::Exhaustive => {
                        clock::sleep_until(deadline);
                        self.list.pop_front(&self.alloc);
                        // SAFETY: as above; the sleep guarantees the grace
                        // period has elapsed.
                        unsafe {
                            self.reclaim_entries(head, self.capacity);
                            self.free_carrier(head);
                        }
                        // We slept to at least `deadline`, so it can stand in
                        // for a fresh clock reading.
                        self.now = deadline;
                    }
                }
            }
        }
    }

    /// Opportunistic purge that withholds the first freed carrier for reuse
    /// instead of returning its bytes. Uses the cached `now` (the caller has
    /// just refreshed it, either by sealing or after sleeping).
    fn purge_and_withhold(&mut self) -> Option<A::Ptr<u8>> {
        let mut reuse = None;
        while let Some(head) = self.list.front() {
            // SAFETY: list members are live carriers.
            let deadline = unsafe { buffer::timestamp(&self.alloc, head) } + self.timeout;
            if self.now <= deadline {
                break;
            }
            self.list.pop_front(&self.alloc);
            // SAFETY: sealed carriers are full; `head` is unlinked.
            unsafe { self.reclaim_entries(head, self.capacity) };

            // Keep the oldest freed carrier and return the rest: later
            // carriers were allocated more recently, and freeing the
            // youngest storage first is kinder to the underlying allocator.
            if reuse.is_none() {
                reuse = Some(head);
                #[cfg(feature = "statistics")]
                {
                    self.stats.buffers_recycled += 1;
                }
            } else {
                // SAFETY: reclaimed above.
                unsafe { self.free_carrier(head) };
            }
        }
        reuse
    }

    /// Blocks until a carrier can be recycled from the delay list.
    ///
    /// Only reached from `retire` after a carrier allocation failure, at
    /// which point the buffer just sealed is on the list. The list is thus
    /// non-empty and, in the worst case, we wait out that very buffer.
    fn recover_carrier(&mut self) -> A::Ptr<u8> {
        #[cfg(feature = "statistics")]
        {
            self.stats.alloc_failures_recovered += 1;
        }
        loop {
            let head = self
                .list
                .front()
                .expect("recovery requires a sealed carrier on the delay list");
            // SAFETY: live list member.
            let deadline = unsafe { buffer::timestamp(&self.alloc, head) } + self.timeout;
            clock::sleep_until(deadline);
            self.now = clock::now();
            if let Some(carrier) = self.purge_and_withhold() {
                return carrier;
            }
            // A clock reading of exactly `deadline` fails the strict
            // admission rule; re-arm the sleep and try again.
        }
    }

    /// Destroys then deallocates the first `len` entries of a carrier.
    ///
    /// Never consults timestamps; eligibility is the caller's business.
    ///
    /// # Safety
    ///
    /// The first `len` entries of `buf` must be initialized and not yet
    /// reclaimed.
    unsafe fn reclaim_entries(&mut self, buf: A::Ptr<u8>, len: usize) {
        for i in 0..len {
            // SAFETY: initialized entry per caller contract.
            let entry = unsafe { buffer::read_entry::<T, A>(&self.alloc, buf, self.layout, i) };
            for j in 0..entry.count {
                // SAFETY: entries record successfully constructed ranges.
                unsafe { self.alloc.destroy(entry.ptr, j) };
            }
            // SAFETY: the range came from a matching allocate on this (or an
            // equal) allocator, and its objects are now destroyed.
            unsafe { self.alloc.deallocate(entry.ptr, entry.count) };
        }
        #[cfg(feature = "statistics")]
        {
            self.stats.entries_reclaimed += len as u64;
        }
    }

    fn new_carrier(&mut self) -> Result<A::Ptr<u8>> {
        let carrier = buffer::create::<T, A>(&mut self.alloc, self.layout, self.now)?;
        #[cfg(feature = "statistics")]
        {
            self.stats.buffers_allocated += 1;
        }
        Ok(carrier)
    }

    /// # Safety
    ///
    /// `buf` must be an unlinked carrier of this instance whose entries have
    /// all been reclaimed.
    unsafe fn free_carrier(&mut self, buf: A::Ptr<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { buffer::destroy(&mut self.alloc, buf, self.layout) };
        #[cfg(feature = "statistics")]
        {
            self.stats.buffers_freed += 1;
        }
    }
}

impl<T, A: RawAlloc + Clone> DeferredAlloc<T, A> {
    /// Creates an adaptor with the same underlying allocator, timeout, and
    /// capacity, but a fresh, empty pipeline.
    ///
    /// This is what [`Clone`] does, fallibly.
    pub fn try_clone(&self) -> Result<Self> {
        Self::try_with_capacity(self.alloc.clone(), self.timeout, self.capacity)
    }

    /// Rebinds the adaptor to another value type.
    ///
    /// The result wraps a copy of the same underlying allocator with the same
    /// timeout and capacity, and starts with an empty pipeline of its own.
    pub fn rebind<U>(&self) -> Result<DeferredAlloc<U, A>> {
        DeferredAlloc::try_with_capacity(self.alloc.clone(), self.timeout, self.capacity)
    }
}

impl<T, A: RawAlloc + Clone> Clone for DeferredAlloc<T, A> {
    /// Copies the underlying allocator and the settings, never the pipeline.
    ///
    /// The clone holds no entries and no sealed buffers from its source:
    /// every entry lives in exactly one pipeline, which is what makes it
    /// sound for equal adaptors to reclaim each other's storage.
    ///
    /// # Panics
    ///
    /// Panics if the clone's initial buffer cannot be allocated; use
    /// [`try_clone`](Self::try_clone) to observe the failure.
    fn clone(&self) -> Self {
        self.try_clone()
            .expect("allocation failed while cloning the delay pipeline")
    }
}

impl<T, A: RawAlloc> PartialEq for DeferredAlloc<T, A> {
    /// Two adaptors compare equal iff storage retired through one may be
    /// reclaimed by the other: equal underlying allocators and equal
    /// timeouts. Capacity is a performance knob and deliberately ignored.
    fn eq(&self, other: &Self) -> bool {
        self.timeout == other.timeout && self.alloc == other.alloc
    }
}

impl<T, A: RawAlloc + fmt::Debug> fmt::Debug for DeferredAlloc<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredAlloc")
            .field("underlying", &self.alloc)
            .field("timeout", &self.timeout)
            .field("delay_buffer_capacity", &self.capacity)
            .field("pending", &self.pending())
            .field("sealed_buffers", &self.list.len())
            .finish_non_exhaustive()
    }
}

impl<T> DeferredAlloc<T, System> {
    /// Convenience constructor wrapping the [`System`] allocator with the
    /// default capacity.
    pub fn with_system(timeout: Duration) -> Self {
        Self::new(System, timeout)
    }
}

impl<T, A: RawAlloc> Drop for DeferredAlloc<T, A> {
    /// Drains the whole pipeline, sleeping as needed: the grace-period
    /// guarantee holds even at destruction.
    ///
    /// Sealed buffers are reclaimed oldest-first so that by the time the
    /// youngest is reached its deadline has often already passed; the
    /// partially-filled current buffer is stamped now, waited out, and its
    /// live prefix reclaimed last. It cannot join the list, whose members
    /// are full by invariant.
    fn drop(&mut self) {
        let Some(current) = self.current.take() else {
            // A retire panicked between sealing and replacement. The sealed
            // carriers are intact but their grace periods may not have run;
            // leak them rather than reclaim early during unwinding.
            #[cfg(debug_assertions)]
            if !self.list.is_empty() {
                eprintln!(
                    "Warning: DeferredAlloc dropped with {} sealed buffer(s) after a mid-retire panic",
                    self.list.len()
                );
            }
            return;
        };

        let stamp = clock::now();
        // SAFETY: live carrier.
        unsafe { buffer::set_timestamp(&self.alloc, current, stamp) };

        self.purge_list(PurgeMode::Exhaustive);
        debug_assert!(self.list.is_empty());

        if self.current_len > 0 {
            // The exhaustive drain above may already have slept past this
            // deadline, in which case the wait is a no-op.
            clock::sleep_until(stamp + self.timeout);
            // SAFETY: exactly the first `current_len` entries are live.
            unsafe { self.reclaim_entries(current, self.current_len) };
        }
        // SAFETY: unlinked and reclaimed.
        unsafe { self.free_carrier(current) };
    }
}
