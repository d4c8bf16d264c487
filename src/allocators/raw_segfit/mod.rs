//! A single-threaded segregated-fit allocator.
//!
//! For a general view of the allocator's operational semantics see the
//! [`crate`] level documentation.
//
// # Additional implementation notes
// ## Heap shape
// The heap is bracketed by two sentinel words, the prologue and the
// epilogue, both of size 0 and marked allocated. Real blocks start one word
// past the heap base, so every payload lands on a 16-byte boundary. The
// epilogue is overwritten by the header of each newly extended block and
// rewritten one word past it, so it always marks the end of the heap.
//
// ## Flag maintenance
// A block's header describes its physical predecessor through the
// `prev_alloc`/`prev_mini` bits. Every path that changes a block's size or
// allocation state must republish those bits into the successor's header;
// that is [`publish_to_next`] and it is called from exactly the coalescing
// and placement paths.

use crate::block::{footer_of, from_payload, next_in_heap, payload_of, prev_in_heap};
use crate::freelist::{class_of, next_of, prev_of, SegIndex, MINI_CLASS, NUM_CLASSES};
use crate::growers::Grower;
use crate::header::{Header, ALIGNMENT, MIN_BLOCK_SIZE, WORD_ALIGN, WORD_SIZE};
use crate::util::{raw_ptr, round_up};

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::{copy_nonoverlapping, null_mut, write_bytes, NonNull};
use std::fmt::Debug;

use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

/// Size of the first heap extension and the floor for no-fit growth.
pub const CHUNKSIZE: usize = 64;

/// Upper bound on fitting candidates the placement search examines before
/// settling for the best seen so far. The only policy knob worth tuning.
pub const MAX_SEARCH: usize = 6;

// The packed word encoding needs the low four size bits free for flags.
const_assert!(ALIGNMENT == 2 * WORD_SIZE);
const_assert!(WORD_ALIGN == WORD_SIZE);
const_assert!(MIN_BLOCK_SIZE == ALIGNMENT);
const_assert!(CHUNKSIZE % ALIGNMENT == 0);

/// A single-threaded segregated-fit memory allocator.
#[repr(C)]
pub struct RawSegfit<G: Grower> {
    index: UnsafeCell<SegIndex>,
    grower: UnsafeCell<G>,
    heap_start: UnsafeCell<*mut Header>,
}

impl<G: Grower> Debug for RawSegfit<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSegfit")
            .field("grower", &self.grower)
            .finish()
    }
}

/// Converts a request of `size` payload bytes into an internal block size:
/// one word of header overhead, rounded up to [`ALIGNMENT`], floored at
/// [`MIN_BLOCK_SIZE`].
#[inline]
fn adjust_size(size: usize) -> Result<usize, ()> {
    // Block sizes beyond isize::MAX can never be served anyway.
    if size > isize::MAX as usize - (ALIGNMENT + WORD_SIZE) {
        return Err(());
    }
    Ok(round_up(size + WORD_SIZE, ALIGNMENT).max(MIN_BLOCK_SIZE))
}

/// Writes a free block of `size` bytes at `block`: the header plus, for
/// standard blocks, the trailing footer copy. Mini blocks have no footer.
///
/// # Safety
/// The `[block, block + size)` span must be owned by the allocator and free
/// of live payload data.
unsafe fn write_free(block: *mut Header, size: usize, prev_alloc: bool, prev_mini: bool) {
    let header = Header::new_unchecked(size, false, prev_alloc, prev_mini);
    *block = header;
    if size > MIN_BLOCK_SIZE {
        *footer_of(block) = header;
    }
}

/// Writes an allocated block header of `size` bytes at `block`. Allocated
/// blocks reclaim the footer word for payload, so only the header is
/// written.
///
/// # Safety
/// Same requirements as [`write_free`].
unsafe fn write_alloc(block: *mut Header, size: usize, prev_alloc: bool, prev_mini: bool) {
    *block = Header::new_unchecked(size, true, prev_alloc, prev_mini);
}

/// Publishes `block`'s allocation state and mini-ness into the flag bits of
/// the physically next block's header.
///
/// # Safety
/// `block` must be a valid non-epilogue block. The next block must be
/// allocated or the epilogue; a free standard successor would need its
/// footer rewritten too, and no caller ever leaves one there.
unsafe fn publish_to_next(block: *mut Header) {
    let next = next_in_heap(block);
    debug_assert!((*next).is_alloc(), "a free successor would have been coalesced.");
    *next = (*next)
        .with_prev_alloc((*block).is_alloc())
        .with_prev_mini((*block).is_mini());
}

impl<G: Grower> RawSegfit<G> {
    /// Creates an allocator instance with the specified grower. The heap is
    /// materialized lazily on the first allocation (or by [`init`]).
    ///
    /// # Safety
    /// Callers must make sure that the provided grower will be the only
    /// object managing its underlying region for the lifetime of the
    /// returned allocator.
    ///
    /// [`init`]: RawSegfit::init
    pub const unsafe fn with_grower(grower: G) -> Self {
        RawSegfit {
            index: UnsafeCell::new(SegIndex::new()),
            grower: UnsafeCell::new(grower),
            heap_start: UnsafeCell::new(null_mut()),
        }
    }

    /// Idempotently initializes the heap: the two sentinel words plus an
    /// initial [`CHUNKSIZE`] extension. Returns whether the heap is usable.
    pub fn init(&self) -> bool {
        unsafe { self.ensure_init().is_ok() }
    }

    /// Allocates `size` bytes and returns the 16-byte-aligned payload
    /// address, or null when `size` is 0 or memory is exhausted.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        unsafe { raw_ptr(self.__allocate(size).ok()) }
    }

    /// Allocates a zero-filled region of `count * size` bytes, guarding the
    /// multiplication against overflow. Null on overflow, zero request or
    /// exhaustion.
    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        if count == 0 || size == 0 {
            return null_mut();
        }
        unsafe { raw_ptr(self.__zero_allocate(count, size).ok()) }
    }

    /// Returns `payload`'s block to the allocator. Null is a no-op.
    ///
    /// # Safety
    /// `payload` must be null or a pointer previously returned by this
    /// allocator and not freed since; double frees and foreign pointers are
    /// undefined.
    #[instrument(level = "info")]
    pub unsafe fn free(&self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        debug_assert!(self.check(line!()));
        debug_assert_eq!(
            payload as usize % ALIGNMENT,
            0,
            "all payloads are 16-byte aligned."
        );

        let block = from_payload(payload);
        debug_assert!((*block).is_alloc(), "block is already free.");

        // Flip only the allocation bit; the predecessor flags stay valid.
        *block = (*block).with_alloc(false);
        self.coalesce(block);

        debug_assert!(self.check(line!()));
    }

    /// Resizes the allocation at `payload` to `size` bytes by moving it: a
    /// new block is allocated, `min(size, old payload size)` bytes are
    /// copied and the old block is freed. `size == 0` frees and returns
    /// null; a null `payload` behaves like [`allocate`]. On failure the
    /// original block is left untouched and null is returned.
    ///
    /// # Safety
    /// Same requirements on `payload` as [`free`](RawSegfit::free).
    ///
    /// [`allocate`]: RawSegfit::allocate
    pub unsafe fn reallocate(&self, payload: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.free(payload);
            return null_mut();
        }
        if payload.is_null() {
            return self.allocate(size);
        }
        raw_ptr(self.__reallocate(payload, size).ok())
    }

    /// Verifies every heap and free-list invariant, reporting the first
    /// violation (tagged with `line`) at error level. Intended for
    /// `debug_assert!(a.check(line!()))` contracts and tests.
    pub fn check(&self, line: u32) -> bool {
        unsafe { self.check_heap(line) }
    }

    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    unsafe fn __allocate(&self, size: usize) -> Result<NonNull<u8>, ()> {
        debug_assert!(size > 0);
        self.ensure_init()?;
        debug_assert!(self.check(line!()));

        let asize = adjust_size(size)?;
        debug!(asize, "Adjusted request size.");

        let mut block = self.find_fit(asize);
        if block.is_null() {
            debug!("No fit found, requesting heap growth.");
            block = self.extend(asize.max(CHUNKSIZE))?;
        }
        debug_assert!((*block).size() >= asize);

        let payload = self.place(block, asize);
        debug_assert!(self.check(line!()));
        Ok(payload)
    }

    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    unsafe fn __reallocate(&self, payload: *mut u8, size: usize) -> Result<NonNull<u8>, ()> {
        let block = from_payload(payload);
        debug_assert!((*block).is_alloc(), "reallocating a free block.");
        let old_payload_size = (*block).size() - WORD_SIZE;

        // No in-place resizing: the new home is carved first so that a
        // failure leaves the old block untouched.
        let new_payload = self.__allocate(size)?;
        copy_nonoverlapping(payload, new_payload.as_ptr(), old_payload_size.min(size));
        self.free(payload);
        Ok(new_payload)
    }

    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    unsafe fn __zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, ()> {
        let total = count.checked_mul(size).ok_or(())?;
        let payload = self.__allocate(total)?;
        write_bytes(payload.as_ptr(), 0, total);
        Ok(payload)
    }

    /// Materializes the empty heap on first use: prologue and epilogue
    /// sentinels followed by the initial extension. Any surplus the grower
    /// hands back beyond the two sentinel words becomes the first free
    /// block directly.
    ///
    /// # Safety
    /// Callers must ensure that no allocator field is currently borrowed.
    unsafe fn ensure_init(&self) -> Result<(), ()> {
        if !(*self.heap_start.get()).is_null() {
            return Ok(());
        }

        let (base, granted) = (*self.grower.get())
            .grow(2 * WORD_SIZE)
            .inspect_err(|_| error!("Could not obtain the initial heap words."))?;
        let base = base.as_ptr();
        debug_assert_eq!(base as usize % ALIGNMENT, 0, "heap base must be aligned.");

        let prologue: *mut Header = base.cast();
        *prologue = Header::new_unchecked(0, true, true, false);
        let heap_start: *mut Header = base.add(WORD_SIZE).cast();
        *heap_start = Header::new_unchecked(0, true, true, false);

        *self.index.get() = SegIndex::new();
        *self.heap_start.get() = heap_start;
        debug!(?heap_start, granted, "Sentinels written.");

        match granted - 2 * WORD_SIZE {
            0 => self.extend(CHUNKSIZE).map(|_| ())?,
            surplus => {
                self.install_block(heap_start, surplus);
            }
        }
        debug_assert!(self.check(line!()));
        Ok(())
    }

    /// Grows the heap by at least `bytes` (rounded up to [`ALIGNMENT`]) and
    /// returns the resulting free block, already coalesced with the last
    /// pre-extension block when that one was free.
    ///
    /// # Safety
    /// The heap must be initialized and no allocator field borrowed.
    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    unsafe fn extend(&self, bytes: usize) -> Result<*mut Header, ()> {
        let size = round_up(bytes, ALIGNMENT);
        let (old_end, granted) = (*self.grower.get())
            .grow(size)
            .inspect_err(|_| error!("Growth failure, no memory."))?;

        // The grower's old end sits one word past the old epilogue; the new
        // block header overwrites that epilogue.
        let block: *mut Header = old_end.as_ptr().sub(WORD_SIZE).cast();
        Ok(self.install_block(block, granted))
    }

    /// Writes a free block of `size` bytes over the old epilogue at
    /// `block`, writes a fresh epilogue one word past it and coalesces.
    ///
    /// # Safety
    /// `block` must hold the current epilogue word and `size` bytes past it
    /// must be owned, unused heap.
    unsafe fn install_block(&self, block: *mut Header, size: usize) -> *mut Header {
        let old_epilogue = *block;
        debug_assert!(old_epilogue.is_alloc() && old_epilogue.size() == 0);

        write_free(block, size, old_epilogue.prev_alloc(), old_epilogue.prev_mini());
        let epilogue = next_in_heap(block);
        *epilogue = Header::new_unchecked(0, true, false, size == MIN_BLOCK_SIZE);
        debug!(?block, size, ?epilogue, "Installed extension block.");

        self.coalesce(block)
    }

    /// Merges `block`, just marked free and not yet linked, with whichever
    /// physical neighbors are free, links the result and republishes the
    /// successor's flags. Returns the surviving block.
    ///
    /// # Safety
    /// `block` must be a valid unlinked block whose header is already
    /// marked free; no allocator field may be borrowed.
    #[instrument(level = "debug", ret(level = Level::DEBUG))]
    unsafe fn coalesce(&self, block: *mut Header) -> *mut Header {
        debug_assert!(!(*block).is_alloc());

        let index = &mut *self.index.get();
        let next = next_in_heap(block);
        let mut start = block;
        let mut size = (*block).size();

        if !(*next).is_alloc() {
            index.remove(next);
            size += (*next).size();
            debug!(?next, "Absorbing free successor.");
        }
        if !(*block).prev_alloc() {
            let prev = prev_in_heap(block);
            index.remove(prev);
            size += (*prev).size();
            start = prev;
            debug!(?prev, "Absorbing free predecessor.");
        }

        // The leftmost participant's own predecessor flags survive the merge.
        let header = *start;
        write_free(start, size, header.prev_alloc(), header.prev_mini());
        index.insert(start);
        publish_to_next(start);
        start
    }

    /// Scans the size classes upward from `class_of(asize)` for the best
    /// fit among at most [`MAX_SEARCH`] fitting candidates. A class that
    /// yields at least one candidate is the last class scanned. Returns
    /// null when no linked block fits.
    ///
    /// # Safety
    /// The heap must be initialized and no allocator field borrowed.
    #[instrument(level = "debug", ret(level = Level::DEBUG))]
    unsafe fn find_fit(&self, asize: usize) -> *mut Header {
        let index = &*self.index.get();
        let mut best: *mut Header = null_mut();
        let mut candidates = 0;

        for class in class_of(asize)..NUM_CLASSES {
            let mut block = index.head(class);
            while !block.is_null() {
                let size = (*block).size();
                if size >= asize {
                    if best.is_null() || size < (*best).size() {
                        best = block;
                    }
                    candidates += 1;
                    if candidates >= MAX_SEARCH {
                        debug!(candidates, "Candidate budget exhausted.");
                        return best;
                    }
                }
                block = next_of(block);
            }
            if !best.is_null() {
                break;
            }
        }
        best
    }

    /// Unlinks the free block `block`, carves an allocated block of `asize`
    /// bytes out of its front and relinks the remainder when it is big
    /// enough to stand alone. Returns the payload address.
    ///
    /// # Safety
    /// `block` must be a linked free block of at least `asize` bytes; no
    /// allocator field may be borrowed.
    #[instrument(level = "debug", ret(level = Level::DEBUG))]
    unsafe fn place(&self, block: *mut Header, asize: usize) -> NonNull<u8> {
        debug_assert!(!(*block).is_alloc());
        let size = (*block).size();
        debug_assert!(size >= asize);

        (*self.index.get()).remove(block);

        let header = *block;
        if size - asize >= MIN_BLOCK_SIZE {
            write_alloc(block, asize, header.prev_alloc(), header.prev_mini());
            let rest = next_in_heap(block);
            write_free(rest, size - asize, true, asize == MIN_BLOCK_SIZE);
            (*self.index.get()).insert(rest);
            publish_to_next(rest);
            debug!(?block, ?rest, remainder = size - asize, "Split block.");
        } else {
            write_alloc(block, size, header.prev_alloc(), header.prev_mini());
            publish_to_next(block);
        }
        NonNull::new_unchecked(payload_of(block))
    }

    /// Walks the whole heap and every free list, verifying the boundary-tag
    /// and list invariants. Reports the first violation at error level.
    ///
    /// # Safety
    /// Callers must ensure that no allocator field is currently borrowed.
    unsafe fn check_heap(&self, line: u32) -> bool {
        let heap_start = *self.heap_start.get();
        if heap_start.is_null() {
            // Nothing to verify before the first initialization.
            return true;
        }

        let prologue: *mut Header = heap_start.cast::<u8>().sub(WORD_SIZE).cast();
        if (*prologue).size() != 0 || !(*prologue).is_alloc() {
            error!(line, "bad prologue word.");
            return false;
        }

        let index = &*self.index.get();
        let mut heap_free_blocks = 0_usize;
        let mut heap_free_size = 0_usize;
        let mut prev_alloc = true;
        let mut prev_mini = false;

        let mut block = heap_start;
        while (*block).size() > 0 {
            let header = *block;
            let size = header.size();

            if block as usize % ALIGNMENT != WORD_SIZE {
                error!(line, ?block, "block payload is not 16-byte aligned.");
                return false;
            }
            if size % ALIGNMENT != 0 || size < MIN_BLOCK_SIZE {
                error!(line, ?block, size, "bad block size.");
                return false;
            }
            if header.prev_alloc() != prev_alloc || header.prev_mini() != prev_mini {
                error!(line, ?block, "predecessor flags disagree with the heap.");
                return false;
            }
            if !header.is_alloc() {
                if !prev_alloc {
                    error!(line, ?block, "two adjacent free blocks escaped coalescing.");
                    return false;
                }
                if !header.is_mini() && *footer_of(block) != header {
                    error!(line, ?block, "footer does not match header.");
                    return false;
                }
                if !index.contains(block) {
                    error!(line, ?block, "free block is not linked in its class.");
                    return false;
                }
                heap_free_blocks += 1;
                heap_free_size += size;
            }

            prev_alloc = header.is_alloc();
            prev_mini = header.is_mini();
            block = next_in_heap(block);
        }

        let epilogue = block;
        if !(*epilogue).is_alloc() {
            error!(line, "bad epilogue word.");
            return false;
        }
        if (*epilogue).prev_alloc() != prev_alloc || (*epilogue).prev_mini() != prev_mini {
            error!(line, "epilogue predecessor flags disagree with the heap.");
            return false;
        }

        let mut listed_blocks = 0_usize;
        let mut listed_size = 0_usize;
        for class in 0..NUM_CLASSES {
            let mut cursor = index.head(class);
            let mut prev_cursor: *mut Header = null_mut();
            while !cursor.is_null() {
                if (cursor as usize) < heap_start as usize || cursor as usize >= epilogue as usize {
                    error!(line, class, ?cursor, "listed block is outside the heap.");
                    return false;
                }
                let header = *cursor;
                if header.is_alloc() {
                    error!(line, class, ?cursor, "allocated block is linked as free.");
                    return false;
                }
                if class_of(header.size()) != class {
                    error!(line, class, ?cursor, size = header.size(), "block linked in the wrong class.");
                    return false;
                }
                if class != MINI_CLASS && prev_of(cursor) != prev_cursor {
                    error!(line, class, ?cursor, "prev link does not point at the preceding node.");
                    return false;
                }
                listed_blocks += 1;
                listed_size += header.size();
                prev_cursor = cursor;
                cursor = next_of(cursor);
            }
        }

        // Either a count or a total-size mismatch means the lists and the
        // heap disagree.
        if listed_blocks != heap_free_blocks || listed_size != heap_free_size {
            error!(
                line,
                listed_blocks, heap_free_blocks, listed_size, heap_free_size,
                "free lists disagree with the heap."
            );
            return false;
        }

        true
    }
}

//---------------impl GlobalAlloc for RawSegfit---------------//

unsafe impl<G: Grower> GlobalAlloc for RawSegfit<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.reallocate(ptr, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.zero_allocate(1, layout.size())
    }
}

impl<G: Grower> PartialEq for RawSegfit<G> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl<G: Grower> Eq for RawSegfit<G> {}

#[cfg(test)]
mod tests;
