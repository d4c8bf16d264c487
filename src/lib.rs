//! A segregated-fit memory allocator written in Rust.
//!
//! The allocator manages a contiguous heap obtained from a pluggable page
//! provider and serves arbitrary allocation sizes with 16-byte payload
//! alignment. It aims for high space utilization at competitive throughput
//! through segregated free lists, boundary-tag coalescing, block splitting
//! and a bounded best-fit search.
//!
//! # Usage
//! The quickest way to try it is over a fixed arena:
//! ```
//! use segfit::growers::ArenaGrower;
//! use segfit::RawSegfit;
//!
//! let mut heap = [0_u8; 4096];
//! let grower = ArenaGrower::new(heap.as_mut_ptr(), heap.len());
//! let allocator = unsafe { RawSegfit::with_grower(grower) };
//!
//! let p = allocator.allocate(100);
//! assert!(!p.is_null());
//! assert_eq!(p as usize % 16, 0);
//! unsafe { allocator.free(p) };
//! assert!(allocator.check(line!()));
//! ```
//!
//! To use it as the global allocator, wrap the single-threaded core in the
//! [`Segfit`] mutex wrapper and point it at the process data segment:
//! ```no_run
//! use segfit::growers::SbrkGrower;
//! use segfit::Segfit;
//!
//! #[global_allocator]
//! static ALLOCATOR: Segfit<SbrkGrower> = unsafe { Segfit::with_grower(SbrkGrower::new(4096)) };
//!
//! fn main() {
//!     let v: Vec<u32> = vec![1, 2, 3];
//!     println!("Served by the segregated heap {:?}", v);
//! }
//! ```
//!
//! # Allocators
//! Two allocators are exported by this crate - [`RawSegfit`] and
//! [`Segfit`]. Use [`RawSegfit`] if you are looking for a single-threaded
//! allocator, [`Segfit`] is just a `Mutex` wrapper over it to allow for
//! multithreading.
//!
//! # Mode of operation
//! - An allocation request is rounded up to one header word plus payload,
//!   in multiples of 16 bytes, then looked up in the size class matching
//!   the adjusted size. The search walks classes upward, keeps the smallest
//!   fitting block seen and gives up on further improvement after a fixed
//!   number of fitting candidates ([`MAX_SEARCH`]); unbounded best fit
//!   would buy a little utilization for a lot of throughput.
//! - A fit that is at least one minimum block bigger than the request is
//!   split; the remainder goes back to its size class.
//! - If nothing fits, the heap is extended through the grower and the new
//!   space is merged with a trailing free block when there is one.
//! - On free the block is merged with whichever physical neighbors are
//!   free and linked into the class matching the merged size.
//!
//! Below is a list of the abstractions used for operating on the heap:
//!
//! ## Blocks
//! The heap is a sequence of blocks bracketed by two one-word sentinels.
//! Each block starts with a header word followed by its payload. Free
//! blocks with at least two words of content also end with a footer copy of
//! the header, which lets the block after them navigate backwards. A
//! 16-byte *mini* block has a single content word: too small for a footer,
//! so its successor learns about it from a flag bit instead.
//!
//! ## Headers
//! A header packs the block size together with three status bits: whether
//! this block is allocated, whether the physically previous block is
//! allocated and whether that previous block is a mini block. The two
//! "previous" bits are what make footers on allocated blocks unnecessary;
//! their word is handed back to the payload.
//!
//! ## Free lists
//! Free blocks are indexed by 15 size classes. Class 0 holds exactly the
//! mini blocks as a singly-linked chain (one content word only fits a
//! `next` pointer); every other class is a doubly-linked chain with O(1)
//! unlinking. Link words live inside the free payload and are reclaimed
//! the moment a block is handed out.
//!
//! ## Growers
//! A grower is the allocator's page provider: anything that acts as a
//! contiguous buffer growable at the end can back the heap. The crate
//! ships [`SbrkGrower`] for the process data segment and [`ArenaGrower`]
//! for caller-owned buffers; implement [`Grower`] to bring your own.
//!
//! [`SbrkGrower`]: growers::SbrkGrower
//! [`ArenaGrower`]: growers::ArenaGrower
//! [`Grower`]: growers::Grower

pub use crate::allocators::raw_segfit::{CHUNKSIZE, MAX_SEARCH};
pub use crate::allocators::RawSegfit;
pub use crate::allocators::Segfit;
pub use crate::header::ALIGNMENT;

pub mod allocators;
mod block;
mod freelist;
pub mod growers;
mod header;
mod util;
