//! # granite-common
//!
//! Foundational memory and I/O primitives for Granite.
//!
//! This crate provides the building blocks shared by Granite's columnar
//! operators:
//!
//! - **Memory**: a page-based [`AllocationPool`](memory::AllocationPool)
//!   that hands out large contiguous runs and raw byte allocations
//! - **Streams**: cursor-driven [`ByteOutputStream`](stream::ByteOutputStream)
//!   and [`ByteInputStream`](stream::ByteInputStream) over chains of
//!   [`ByteRange`](stream::ByteRange)s
//! - **Errors**: the shared [`MemoryError`] type
//!
//! ## Example
//!
//! ```rust
//! use granite_common::memory::AllocationPool;
//!
//! let mut pool = AllocationPool::new();
//! pool.new_run(64 * 1024).expect("run allocation");
//! assert!(pool.available_in_run() >= 64 * 1024);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod memory;
pub mod stream;

pub use error::{MemoryError, MemoryResult};
