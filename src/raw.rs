//! Underlying Allocator Seam
//!
//! The delay pipeline is an adaptor: all storage it hands out, all storage it
//! reclaims, and the carrier buffers of the pipeline itself come from a
//! wrapped, underlying allocator. This module defines that seam as the
//! [`RawAlloc`] trait, together with [`System`], the default implementation
//! backed by the global allocator.
//!
//! # Pointer Flavors
//!
//! Handles returned by an underlying allocator are not necessarily raw
//! addresses: an allocator carving storage out of a memory-mapped file may
//! hand out offset handles that are only meaningful relative to the mapping.
//! `RawAlloc` therefore exposes an associated handle type per value type,
//! [`RawAlloc::Ptr`], and a single sanctioned way to turn a handle into an
//! in-process address, [`RawAlloc::resolve`]. The pipeline stores handles and
//! resolves them only at the point of placement construction or destruction.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::{Error, Result};

/// The contract the delay pipeline requires from an underlying allocator.
///
/// This is the Rust rendition of the four operations a classic allocator
/// adaptor delegates to (allocate N, deallocate N, construct in place,
/// destroy in place), plus handle resolution and an equality predicate.
///
/// # Contract
///
/// - `allocate::<T>(n)` returns a handle to storage for `n` contiguous,
///   uninitialized `T`s, aligned for `T`. Byte-granularity requests
///   (`T = u8`) back the pipeline's carrier buffers and must additionally be
///   aligned suitably for any scalar type (at least 16 bytes), the same
///   guarantee `malloc` provides.
/// - `deallocate` accepts exactly the handles `allocate` produced, with the
///   same count, and never fails.
/// - `resolve` maps a handle to the address of its first object in this
///   process. The address stays valid until the handle is deallocated.
/// - Two allocators that compare equal may deallocate each other's storage.
///   This is what [`PartialEq`] asserts here, mirroring the classic
///   allocator-equality requirement.
///
/// `construct` and `destroy` have provided implementations in terms of
/// `resolve`; implementations with bookkeeping needs may override them.
pub trait RawAlloc: PartialEq {
    /// Handle to `count` contiguous `T`s.
    ///
    /// May be a plain `NonNull<T>` or a smarter handle such as an offset into
    /// a shared mapping. Handles are plain data: copying one does not copy
    /// the storage it designates.
    type Ptr<T>: Copy;

    /// Allocates uninitialized storage for `count` objects of type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the allocator refuses, or
    /// [`Error::LayoutOverflow`] if the byte size overflows.
    fn allocate<T>(&mut self, count: usize) -> Result<Self::Ptr<T>>;

    /// Returns storage previously obtained from [`allocate`](Self::allocate).
    ///
    /// Never fails.
    ///
    /// # Safety
    ///
    /// `ptr` must come from a matching `allocate::<T>(count)` on this
    /// allocator (or one equal to it) and must not have been deallocated
    /// already. Objects in the storage must already be destroyed.
    unsafe fn deallocate<T>(&mut self, ptr: Self::Ptr<T>, count: usize);

    /// Resolves a handle to the in-process address of its first object.
    fn resolve<T>(&self, ptr: Self::Ptr<T>) -> NonNull<T>;

    /// Constructs `value` in the `index`-th slot of the range behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must designate live storage for more than `index` objects, and
    /// the slot must not currently hold a live object.
    unsafe fn construct<T>(&mut self, ptr: Self::Ptr<T>, index: usize, value: T) {
        // SAFETY: the caller guarantees the slot is in bounds and vacant;
        // `resolve` yields a valid, aligned address for the range.
        unsafe { self.resolve(ptr).as_ptr().add(index).write(value) }
    }

    /// Destroys the object in the `index`-th slot of the range behind `ptr`.
    ///
    /// The storage itself is not released; pair with
    /// [`deallocate`](Self::deallocate).
    ///
    /// # Safety
    ///
    /// The slot must hold a live object, and no reference to it may outlive
    /// this call.
    unsafe fn destroy<T>(&mut self, ptr: Self::Ptr<T>, index: usize) {
        // SAFETY: the caller guarantees a live object in bounds.
        unsafe { core::ptr::drop_in_place(self.resolve(ptr).as_ptr().add(index)) }
    }
}

/// Minimum alignment of every `System` allocation.
///
/// Byte-granularity requests carve carrier buffers whose headers contain
/// timestamps and link handles, so they must be as aligned as `malloc`
/// storage.
const MIN_ALIGN: usize = 16;

/// The default underlying allocator, backed by `std::alloc`.
///
/// Stateless and always equal to every other instance, with raw `NonNull`
/// handles; the sensible wrapped allocator when nothing fancier is needed.
///
/// # Example
///
/// ```rust
/// use grace_alloc::{RawAlloc, System};
///
/// let mut alloc = System;
/// let p = alloc.allocate::<u32>(4).unwrap();
/// unsafe {
///     alloc.construct(p, 0, 7u32);
///     alloc.destroy(p, 0);
///     alloc.deallocate(p, 4);
/// }
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct System;

impl System {
    fn layout<T>(count: usize) -> Result<Layout> {
        let array = Layout::array::<T>(count).map_err(|_| Error::LayoutOverflow)?;
        Layout::from_size_align(array.size(), array.align().max(MIN_ALIGN))
            .map_err(|_| Error::LayoutOverflow)
    }
}

impl RawAlloc for System {
    type Ptr<T> = NonNull<T>;

    fn allocate<T>(&mut self, count: usize) -> Result<NonNull<T>> {
        let layout = Self::layout::<T>(count)?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr.cast()).ok_or(Error::AllocationFailed)
    }

    unsafe fn deallocate<T>(&mut self, ptr: NonNull<T>, count: usize) {
        // The layout computation succeeded when this storage was allocated,
        // so it cannot fail here.
        let Ok(layout) = Self::layout::<T>(count) else {
            return;
        };
        if layout.size() == 0 {
            return;
        }
        // SAFETY: the caller guarantees `ptr` came from `allocate::<T>(count)`,
        // which used this exact layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr().cast(), layout) }
    }

    #[inline]
    fn resolve<T>(&self, ptr: NonNull<T>) -> NonNull<T> {
        ptr
    }
}
