//! The [`RawSegfit`] and [`Segfit`] allocators.

pub mod raw_segfit;
pub mod segfit;

pub use raw_segfit::RawSegfit;
pub use segfit::Segfit;
