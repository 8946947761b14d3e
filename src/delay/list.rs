//! The Delay List
//!
//! An intrusive singly-linked FIFO of sealed carriers, ordered by sealing
//! time. The link field lives in the carrier header, so pushing and popping
//! allocate nothing; head and tail are cached for O(1) access at both ends.
//!
//! # Invariants
//!
//! - Every member is full: a carrier reaches the list only by sealing, and
//!   sealing happens exactly when the current buffer fills.
//! - Timestamps are non-decreasing from head to tail: carriers are stamped
//!   from a monotonic clock at sealing and appended in sealing order.
//! - The head is therefore the oldest carrier and the first one eligible for
//!   reclamation.

use crate::delay::buffer;
use crate::raw::RawAlloc;

pub(crate) struct DelayList<A: RawAlloc> {
    head: Option<A::Ptr<u8>>,
    tail: Option<A::Ptr<u8>>,
    len: usize,
}

impl<A: RawAlloc> DelayList<A> {
    pub(crate) const fn new() -> Self {
        DelayList {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// The oldest sealed carrier, if any.
    #[inline]
    pub(crate) fn front(&self) -> Option<A::Ptr<u8>> {
        self.head
    }

    /// Appends a freshly sealed carrier.
    ///
    /// # Safety
    ///
    /// `buf` must be a live carrier of `alloc`, not already on a list.
    pub(crate) unsafe fn push_back(&mut self, alloc: &A, buf: A::Ptr<u8>) {
        // SAFETY: live unlinked carrier per caller contract; we own the links
        // of every member.
        unsafe {
            buffer::set_next(alloc, buf, None);
            match self.tail {
                Some(tail) => buffer::set_next(alloc, tail, Some(buf)),
                None => self.head = Some(buf),
            }
        }
        self.tail = Some(buf);
        self.len += 1;
    }

    /// Unlinks and returns the oldest carrier.
    ///
    /// The carrier's entries are untouched; the caller reclaims them and then
    /// frees or recycles the carrier.
    pub(crate) fn pop_front(&mut self, alloc: &A) -> Option<A::Ptr<u8>> {
        let head = self.head?;
        // SAFETY: `head` is a live list member.
        let next = unsafe { buffer::next(alloc, head) };
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }
}
