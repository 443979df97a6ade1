//! Memory management primitives for Granite.
//!
//! This module provides the page-based allocation pool that operator-level
//! allocators draw from:
//!
//! - **Runs**: large page-aligned contiguous allocations, rounded to
//!   power-of-two page counts
//! - **Fixed runs**: exact page-rounded allocations that bypass the size
//!   classes
//! - **Raw allocations**: byte-accounted allocate/free pairs for callers
//!   that track their own pointers
//!
//! The pool is owned mutably by a single consumer; it performs no internal
//! locking.

mod pool;

pub use pool::{
    num_pages, page_bytes, Allocation, AllocationPool, LARGEST_CLASS_PAGES, PAGE_SIZE,
};
