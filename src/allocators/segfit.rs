//! A thread-safe segregated-fit allocator.

use crate::allocators::RawSegfit;
use crate::growers::Grower;

use core::alloc::{GlobalAlloc, Layout};
use std::sync::Mutex;

/// A thread-safe segregated-fit memory allocator.
///
/// This allocator is just a `Mutex` wrapper over [`RawSegfit`]; the core
/// itself stays single-threaded.
#[repr(C)]
pub struct Segfit<G: Grower> {
    inner: Mutex<RawSegfit<G>>,
}

impl<G: Grower> Segfit<G> {
    /// # Safety
    /// Callers must make sure that the provided grower will be the only
    /// object managing its underlying region for the lifetime of the
    /// returned allocator.
    pub const unsafe fn with_grower(grower: G) -> Self {
        Segfit {
            inner: Mutex::new(RawSegfit::with_grower(grower)),
        }
    }

    /// See [`RawSegfit::init`].
    pub fn init(&self) -> bool {
        self.inner.lock().unwrap().init()
    }

    /// See [`RawSegfit::allocate`].
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.inner.lock().unwrap().allocate(size)
    }

    /// See [`RawSegfit::zero_allocate`].
    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        self.inner.lock().unwrap().zero_allocate(count, size)
    }

    /// See [`RawSegfit::free`].
    ///
    /// # Safety
    /// Same requirements as [`RawSegfit::free`].
    pub unsafe fn free(&self, payload: *mut u8) {
        self.inner.lock().unwrap().free(payload)
    }

    /// See [`RawSegfit::reallocate`].
    ///
    /// # Safety
    /// Same requirements as [`RawSegfit::reallocate`].
    pub unsafe fn reallocate(&self, payload: *mut u8, size: usize) -> *mut u8 {
        self.inner.lock().unwrap().reallocate(payload, size)
    }

    /// See [`RawSegfit::check`].
    pub fn check(&self, line: u32) -> bool {
        self.inner.lock().unwrap().check(line)
    }
}

unsafe impl<G: Grower> Sync for Segfit<G> {}

//---------------impl GlobalAlloc for Segfit---------------//

unsafe impl<G: Grower> GlobalAlloc for Segfit<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().unwrap().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.lock().unwrap().dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.inner.lock().unwrap().realloc(ptr, layout, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().unwrap().alloc_zeroed(layout)
    }
}
