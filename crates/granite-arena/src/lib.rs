//! # granite-arena
//!
//! Arena allocator for the variable-length payloads attached to rows of
//! Granite's hash tables, aggregation states, and other columnar
//! operators.
//!
//! The arena carves small- to medium-sized blocks out of large slabs
//! obtained from `granite-common`'s page pool. Freed blocks go into
//! size-classed free lists and coalesce with their slab neighbors
//! immediately. A single logical value may span several non-contiguous
//! blocks, linked through the last word of each block, and is written and
//! read through the byte-stream cursors of `granite-common`.
//!
//! ## Example
//!
//! ```rust
//! use granite_arena::StringArena;
//! use granite_common::stream::ByteOutputStream;
//!
//! let mut arena = StringArena::new();
//! let mut stream = ByteOutputStream::new();
//!
//! // Write a value; it grows into chained blocks as needed.
//! let start = arena.new_write(&mut stream, 16);
//! stream.append(&mut arena, b"columnar engines store many strings");
//! arena.finish_write(&stream, 0);
//!
//! // Read it back through the chain.
//! let mut input = unsafe { StringArena::prepare_read(start.header) };
//! let mut value = vec![0u8; 35];
//! input.read_bytes(&mut value);
//! assert_eq!(&value, b"columnar engines store many strings");
//!
//! arena.check_consistency();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arena;
pub mod free_list;
pub mod header;
pub mod view;

pub use arena::{
    free_list_index, Position, StringArena, FREE_LIST_SIZES, MAX_ALLOC, MAX_CHECKED_FOR_FIT,
    MIN_ALLOC, MIN_CONTIGUOUS, NUM_FREE_LISTS, UNIT_SIZE,
};
pub use header::{Header, HEADER_SIZE};
pub use view::{StringView, INLINE_CAPACITY};
