//! [`Grower`] trait and structures that implement it.
//!
//! A grower is the page provider behind an allocator: a contiguous region
//! of memory that can only grow upward. The allocators in
//! [`crate::allocators`] are generic over their grower, so the same core
//! can run over the process data segment ([`SbrkGrower`]) or over a caller
//! supplied buffer ([`ArenaGrower`]).

use crate::header::ALIGNMENT;
use crate::util::{checked_add, find_aligned, round_up};

use core::ptr::NonNull;

use libc::{brk, sbrk};

/// A trait for types that act as a contiguous growable memory region.
///
/// # Contract
/// * `grow(0)` is a query: it returns the current end of the region and a
///   granted size of 0 without growing.
/// * For `size > 0`, `size` is a multiple of [`ALIGNMENT`]; the granted
///   size is at least `size` and also a multiple of [`ALIGNMENT`].
/// * The pointer returned by the first growing call is [`ALIGNMENT`]-byte
///   aligned. Since all grants are multiples of [`ALIGNMENT`], every later
///   region end stays aligned as well.
///
/// # Safety
/// * Copying, cloning, or moving the grower must not invalidate any
///   pointers into the region it manages. This generally means that growers
///   should not own but reference their underlying buffers.
pub unsafe trait Grower {
    /// Grows the region by at least `size` bytes. Returns the old end of
    /// the region and the granted size, or `Err(())` if the growth failed.
    ///
    /// # Safety
    /// Callers must be the only party mutating the region end; implementors
    /// must uphold the alignment contract above.
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()>;
}

/// A grower that uses [`libc::brk`] to operate on the end of the process's
/// data segment.
#[derive(Debug)]
pub struct SbrkGrower {
    heap_end: Option<NonNull<u8>>,
    min_increment: usize,
}

impl SbrkGrower {
    /// Creates a grower that never grows by less than `min_increment` bytes
    /// at a time (rounded up to [`ALIGNMENT`]); a larger increment trades
    /// slack bytes for fewer `brk` calls.
    #[inline(always)]
    pub const fn new(min_increment: usize) -> Self {
        SbrkGrower { heap_end: None, min_increment }
    }

    /// Queries the initial program break via `sbrk(0)` and aligns it.
    ///
    /// # Safety
    /// This function is unsafe since it assumes that the grower wasn't
    /// previously initialized and that no other object (grower or not)
    /// manages the program break.
    unsafe fn try_init(&mut self) -> Result<(), ()> {
        debug_assert!(self.heap_end.is_none());
        let heap_end = unsafe { sbrk(0) };
        debug_assert_ne!(heap_end as isize, -1, "Calling sbrk(0) should never fail.");
        debug_assert_ne!(heap_end as usize, 0);
        unsafe {
            self.heap_end = Some(NonNull::new_unchecked(
                find_aligned(heap_end.cast(), ALIGNMENT).ok_or(())? as *mut u8,
            ))
        };
        Ok(())
    }
}

unsafe impl Grower for SbrkGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()> {
        if self.heap_end.is_none() {
            unsafe { self.try_init()? };
        }
        let heap_end = self.heap_end.unwrap();
        if size == 0 {
            return Ok((heap_end, 0));
        }
        debug_assert_eq!(size % ALIGNMENT, 0);

        let granted = round_up(size.max(self.min_increment), ALIGNMENT);
        let new_heap_end: *mut u8 = checked_add(heap_end.as_ptr(), granted).ok_or(())? as _;
        if unsafe { brk(new_heap_end.cast()) == -1 } {
            return Err(());
        }
        self.heap_end = unsafe { Some(NonNull::new_unchecked(new_heap_end)) };
        Ok((heap_end, granted))
    }
}

/// A grower that hands out slices of a fixed, caller-owned buffer.
///
/// Grants are exact, which makes heap shapes reproducible; useful for tests
/// and for embedding the allocator over a preallocated arena.
#[derive(Debug)]
pub struct ArenaGrower {
    heap_end: *mut u8,
    arena_end: *mut u8,
}

impl ArenaGrower {
    /// Creates a grower over `len` bytes starting at `buf`. The usable
    /// region starts at the first [`ALIGNMENT`]-aligned address inside the
    /// buffer.
    pub fn new(buf: *mut u8, len: usize) -> Self {
        let offset = buf.align_offset(ALIGNMENT);
        ArenaGrower {
            heap_end: unsafe { buf.add(offset.min(len)) },
            arena_end: unsafe { buf.add(len) },
        }
    }
}

unsafe impl Grower for ArenaGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()> {
        let heap_end = self.heap_end;
        if size == 0 {
            return Ok((NonNull::new(heap_end).ok_or(())?, 0));
        }
        debug_assert_eq!(size % ALIGNMENT, 0);

        let new_heap_end = checked_add(heap_end, size).ok_or(())? as *mut u8;
        if new_heap_end > self.arena_end {
            return Err(());
        }
        self.heap_end = new_heap_end;
        Ok((NonNull::new(heap_end).ok_or(())?, size))
    }
}

unsafe impl<T: Grower + ?Sized> Grower for &mut T {
    unsafe fn grow(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ()> {
        (*self).grow(size)
    }
}
