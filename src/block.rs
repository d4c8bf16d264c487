//! Navigation between a block, its payload, its footer and its physical
//! neighbors in the heap.
//!
//! A block is addressed by a pointer to its [`Header`] word. The payload
//! starts one word after the header. Free blocks with at least two words of
//! content end with a footer word that duplicates the header; allocated
//! blocks and free mini blocks have no footer, which is why backwards
//! navigation relies on the `prev_alloc`/`prev_mini` bits of the current
//! block instead of unconditionally reading a footer.

use crate::header::{Header, MIN_BLOCK_SIZE, WORD_SIZE};

/// Returns a pointer to the payload of `block`.
///
/// # Safety
/// `block` must point to a valid header word that is not the epilogue.
#[inline(always)]
pub(crate) unsafe fn payload_of(block: *mut Header) -> *mut u8 {
    block.cast::<u8>().add(WORD_SIZE)
}

/// Returns a pointer to the header of the block whose payload is `payload`.
///
/// # Safety
/// `payload` must be an address previously handed out by the allocator (or
/// the payload address of a known block); anything else is undefined.
#[inline(always)]
pub(crate) unsafe fn from_payload(payload: *mut u8) -> *mut Header {
    payload.sub(WORD_SIZE).cast()
}

/// Returns a pointer to the footer word of `block`.
///
/// # Safety
/// `block` must be a free block with at least two words of content; mini and
/// allocated blocks have no footer, their trailing word belongs to the
/// payload.
#[inline(always)]
pub(crate) unsafe fn footer_of(block: *mut Header) -> *mut Header {
    debug_assert!(!(*block).is_alloc(), "allocated blocks carry no footer.");
    debug_assert!((*block).size() > MIN_BLOCK_SIZE, "mini blocks carry no footer.");
    block.cast::<u8>().add((*block).size() - WORD_SIZE).cast()
}

/// Returns the physically next block in the heap.
///
/// # Safety
/// `block` must be a valid non-epilogue block; the epilogue has size 0 and
/// no successor.
#[inline(always)]
pub(crate) unsafe fn next_in_heap(block: *mut Header) -> *mut Header {
    debug_assert!((*block).size() > 0, "called next_in_heap on a sentinel.");
    block.cast::<u8>().add((*block).size()).cast()
}

/// Returns the physically previous block in the heap.
///
/// Mini blocks have a fixed size so no footer lookup is needed; otherwise
/// the previous block must be a free standard block and its footer sits one
/// word before `block`.
///
/// # Safety
/// The previous block must be free (`prev_alloc` clear) or a mini block;
/// allocated standard blocks reuse their footer word as payload and cannot
/// be navigated to from the right.
#[inline]
pub(crate) unsafe fn prev_in_heap(block: *mut Header) -> *mut Header {
    if (*block).prev_mini() {
        return block.cast::<u8>().sub(MIN_BLOCK_SIZE).cast();
    }
    debug_assert!(
        !(*block).prev_alloc(),
        "allocated standard blocks have no footer to navigate through."
    );
    let footer: *mut Header = block.cast::<u8>().sub(WORD_SIZE).cast();
    block.cast::<u8>().sub((*footer).size()).cast()
}
