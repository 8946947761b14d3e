//! Shared test fixtures: destruction-recording value types and instrumented
//! underlying allocators mirroring low-memory and offset-handle deployments.

#![allow(dead_code)]

use std::alloc::Layout;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Instant;

use grace_alloc::{Error, RawAlloc, Result, System};

/// Shared destruction log.
pub type Log = Rc<RefCell<Vec<usize>>>;

pub fn drop_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// A value that records its tag in a shared log when dropped.
pub struct DropTally {
    tag: usize,
    log: Log,
}

impl DropTally {
    pub fn new(tag: usize, log: &Log) -> Self {
        DropTally {
            tag,
            log: Rc::clone(log),
        }
    }
}

impl Drop for DropTally {
    fn drop(&mut self) {
        self.log.borrow_mut().push(self.tag);
    }
}

/// Like [`DropTally`], but records the instant of destruction as well.
pub struct DropClock {
    tag: usize,
    log: Rc<RefCell<Vec<(usize, Instant)>>>,
}

impl DropClock {
    pub fn new(tag: usize, log: &Rc<RefCell<Vec<(usize, Instant)>>>) -> Self {
        DropClock {
            tag,
            log: Rc::clone(log),
        }
    }
}

impl Drop for DropClock {
    fn drop(&mut self) {
        self.log.borrow_mut().push((self.tag, Instant::now()));
    }
}

/// Wraps [`System`] and tracks the number of live allocations through a
/// counter shared by all copies.
#[derive(Clone)]
pub struct CountingAlloc {
    inner: System,
    live: Rc<Cell<isize>>,
}

impl CountingAlloc {
    pub fn new() -> Self {
        CountingAlloc {
            inner: System,
            live: Rc::new(Cell::new(0)),
        }
    }

    pub fn live(&self) -> isize {
        self.live.get()
    }
}

impl PartialEq for CountingAlloc {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.live, &other.live)
    }
}

impl RawAlloc for CountingAlloc {
    type Ptr<T> = NonNull<T>;

    fn allocate<T>(&mut self, count: usize) -> Result<NonNull<T>> {
        let p = self.inner.allocate(count)?;
        self.live.set(self.live.get() + 1);
        Ok(p)
    }

    unsafe fn deallocate<T>(&mut self, ptr: NonNull<T>, count: usize) {
        unsafe { self.inner.deallocate(ptr, count) };
        self.live.set(self.live.get() - 1);
    }

    fn resolve<T>(&self, ptr: NonNull<T>) -> NonNull<T> {
        ptr
    }
}

/// Refuses allocations once the number of live allocations reaches a cap.
/// The live count is shared by all copies so it can be observed externally.
#[derive(Clone)]
pub struct BoundedAlloc {
    inner: System,
    max_live: usize,
    live: Rc<Cell<usize>>,
}

impl BoundedAlloc {
    pub fn new(max_live: usize) -> Self {
        BoundedAlloc {
            inner: System,
            max_live,
            live: Rc::new(Cell::new(0)),
        }
    }

    pub fn live(&self) -> usize {
        self.live.get()
    }
}

impl PartialEq for BoundedAlloc {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.live, &other.live) && self.max_live == other.max_live
    }
}

impl RawAlloc for BoundedAlloc {
    type Ptr<T> = NonNull<T>;

    fn allocate<T>(&mut self, count: usize) -> Result<NonNull<T>> {
        if self.live.get() + 1 > self.max_live {
            return Err(Error::AllocationFailed);
        }
        let p = self.inner.allocate(count)?;
        self.live.set(self.live.get() + 1);
        Ok(p)
    }

    unsafe fn deallocate<T>(&mut self, ptr: NonNull<T>, count: usize) {
        unsafe { self.inner.deallocate(ptr, count) };
        self.live.set(self.live.get() - 1);
    }

    fn resolve<T>(&self, ptr: NonNull<T>) -> NonNull<T> {
        ptr
    }
}

/// Fails the next allocation while a shared flag is set, clearing the flag so
/// the failure can be observed from outside.
#[derive(Clone)]
pub struct OomAlloc {
    inner: System,
    oom: Rc<Cell<bool>>,
}

impl OomAlloc {
    pub fn new() -> Self {
        OomAlloc {
            inner: System,
            oom: Rc::new(Cell::new(false)),
        }
    }

    pub fn trip(&self) {
        self.oom.set(true);
    }

    pub fn is_armed(&self) -> bool {
        self.oom.get()
    }
}

impl PartialEq for OomAlloc {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.oom, &other.oom)
    }
}

impl RawAlloc for OomAlloc {
    type Ptr<T> = NonNull<T>;

    fn allocate<T>(&mut self, count: usize) -> Result<NonNull<T>> {
        if self.oom.get() {
            self.oom.set(false);
            return Err(Error::AllocationFailed);
        }
        self.inner.allocate(count)
    }

    unsafe fn deallocate<T>(&mut self, ptr: NonNull<T>, count: usize) {
        unsafe { self.inner.deallocate(ptr, count) };
    }

    fn resolve<T>(&self, ptr: NonNull<T>) -> NonNull<T> {
        ptr
    }
}

/// Handle into an [`OffsetAlloc`] arena: an offset, never an address.
pub struct OffsetPtr<T> {
    offset: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for OffsetPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for OffsetPtr<T> {}

impl<T> PartialEq for OffsetPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

struct Arena {
    // u128 units keep the arena base 16-aligned, so aligning an offset
    // aligns the resolved address.
    storage: UnsafeCell<Box<[u128]>>,
    bump: Cell<usize>,
    outstanding: Cell<usize>,
}

impl Arena {
    fn capacity(&self) -> usize {
        // SAFETY: the box itself is never mutated, only the bytes behind it.
        unsafe { (&*self.storage.get()).len() * core::mem::size_of::<u128>() }
    }
}

/// A bump allocator handing out offset handles into one contiguous arena,
/// standing in for a managed-mapping allocator whose pointers are not raw
/// addresses.
#[derive(Clone)]
pub struct OffsetAlloc {
    arena: Rc<Arena>,
}

impl OffsetAlloc {
    const MIN_ALIGN: usize = 16;

    pub fn with_capacity(bytes: usize) -> Self {
        let units = bytes.div_ceil(core::mem::size_of::<u128>());
        OffsetAlloc {
            arena: Rc::new(Arena {
                storage: UnsafeCell::new(vec![0u128; units].into_boxed_slice()),
                bump: Cell::new(0),
                outstanding: Cell::new(0),
            }),
        }
    }

    /// Allocations handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.arena.outstanding.get()
    }

    fn base(&self) -> *mut u8 {
        // SAFETY: the arena storage is never reallocated or aliased as a
        // whole; all access goes through disjoint allocated ranges.
        unsafe { (*self.arena.storage.get()).as_mut_ptr().cast() }
    }
}

impl PartialEq for OffsetAlloc {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.arena, &other.arena)
    }
}

impl RawAlloc for OffsetAlloc {
    type Ptr<T> = OffsetPtr<T>;

    fn allocate<T>(&mut self, count: usize) -> Result<OffsetPtr<T>> {
        let layout = Layout::array::<T>(count).map_err(|_| Error::LayoutOverflow)?;
        let align = layout.align().max(Self::MIN_ALIGN);
        let offset = self.arena.bump.get().next_multiple_of(align);
        let end = offset
            .checked_add(layout.size())
            .ok_or(Error::LayoutOverflow)?;
        if end > self.arena.capacity() {
            return Err(Error::AllocationFailed);
        }
        self.arena.bump.set(end);
        self.arena.outstanding.set(self.arena.outstanding.get() + 1);
        Ok(OffsetPtr {
            offset,
            _marker: PhantomData,
        })
    }

    unsafe fn deallocate<T>(&mut self, _ptr: OffsetPtr<T>, _count: usize) {
        // Bump arena: storage is reclaimed wholesale when the arena drops.
        self.arena.outstanding.set(self.arena.outstanding.get() - 1);
    }

    fn resolve<T>(&self, ptr: OffsetPtr<T>) -> NonNull<T> {
        // SAFETY: offsets are only handed out inside the arena.
        unsafe { NonNull::new_unchecked(self.base().add(ptr.offset).cast()) }
    }
}
