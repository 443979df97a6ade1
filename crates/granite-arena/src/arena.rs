//! The string arena allocator.
//!
//! [`StringArena`] serves small- to medium-sized variable-length payloads
//! (string values, serialized aggregation state) attached to rows of hash
//! tables and other columnar operators. It carves blocks out of large
//! slabs obtained from an [`AllocationPool`], keeps freed blocks in
//! size-classed free lists with immediate coalescing, and lets a single
//! logical value span several non-contiguous blocks through a
//! pointer-chained continuation scheme.
//!
//! # Slab layout
//!
//! ```text
//! +--------+---------+--------+---------+ ... +------------+
//! | Header | payload | Header | payload |     | ARENA_END  |
//! +--------+---------+--------+---------+ ... +------------+
//! ```
//!
//! Adjacent blocks tile the slab exactly. A free block keeps its list
//! node in the first payload bytes and mirrors its size in the last four
//! payload bytes, so the successor can find it for backward coalescing.
//!
//! # Writing and reading
//!
//! Writers drive a [`ByteOutputStream`] through `new_write` /
//! `finish_write`; when the active block fills, the stream asks the arena
//! for a continuation range and the value grows into a fresh block linked
//! from the last word of the previous one. Readers walk the chain through
//! [`StringArena::prepare_read`].
//!
//! The arena is single-threaded and non-reentrant: one write may be open
//! at a time, and nothing here locks.

use std::collections::HashMap;
use std::ptr::{self, NonNull};

use granite_common::memory::{
    num_pages, page_bytes, AllocationPool, PAGE_SIZE,
};
use granite_common::stream::{ByteInputStream, ByteOutputStream, ByteRange, StreamArena};
use tracing::{debug, warn};

use crate::free_list::CompactDoubleList;
use crate::header::{Header, HEADER_SIZE};
use crate::view::StringView;

/// Minimum payload size of a block.
///
/// Large enough for a free-list node plus the trailing boundary tag.
pub const MIN_ALLOC: i32 = 16;

/// Minimum slab size requested from the pool (64 KiB).
pub const UNIT_SIZE: i32 = 16 * PAGE_SIZE as i32;

/// Largest payload served from slabs; exact-size requests above this go
/// straight to the pool and are tracked individually.
pub const MAX_ALLOC: i32 = UNIT_SIZE;

/// Minimum size of a continuation range, so chains do not degenerate into
/// strings of tiny blocks.
pub const MIN_CONTIGUOUS: i32 = 48;

/// Number of free-list size classes.
pub const NUM_FREE_LISTS: usize = 7;

/// Entries scanned per class before settling for the largest seen.
pub const MAX_CHECKED_FOR_FIT: usize = 5;

/// Upper bounds of the free-list classes, strictly increasing.
///
/// The bounds follow a 16-byte container payload grid plus header
/// padding (8*16+20, 16*16+20, ...). The two trailing `i32::MAX` entries
/// pad the table to eight lanes so an eight-wide vector compare can scan
/// it in one shot; only the first is a real class bound.
pub const FREE_LIST_SIZES: [i32; NUM_FREE_LISTS + 1] = [
    72,
    8 * 16 + 20,
    16 * 16 + 20,
    32 * 16 + 20,
    64 * 16 + 20,
    128 * 16 + 20,
    i32::MAX,
    i32::MAX,
];

/// Size of the continuation pointer stored in the last payload word.
const WORD_SIZE: usize = std::mem::size_of::<*mut Header>();

/// Returns the lowest set class index of `candidates & mask`, or a value
/// `>= NUM_FREE_LISTS` when none qualifies.
fn free_list_index_masked(size: i32, mask: u32) -> u32 {
    let mut candidates = 0u32;
    for (index, bound) in FREE_LIST_SIZES.iter().enumerate() {
        if size < *bound {
            candidates |= 1 << index;
        }
    }
    (candidates & mask).trailing_zeros()
}

/// Returns the free-list class holding blocks of `size` payload bytes.
#[must_use]
pub fn free_list_index(size: i32) -> usize {
    free_list_index_masked(size, u32::MAX) as usize
}

/// Returns a mask of the bits below `bits`.
const fn low_mask(bits: u32) -> u32 {
    (1u32 << bits) - 1
}

/// Rounds `bytes` up to a multiple of the header word.
const fn round_up_word(bytes: i32) -> i32 {
    (bytes + (HEADER_SIZE as i32 - 1)) & !(HEADER_SIZE as i32 - 1)
}

/// Rounds `value` up to a multiple of `factor`.
const fn round_up(value: usize, factor: usize) -> usize {
    (value + factor - 1) / factor * factor
}

/// Returns the location of the boundary tag read by `header`: the 4 bytes
/// just before it, which are the last payload bytes of a free predecessor.
unsafe fn previous_free_size(header: *mut Header) -> *mut u32 {
    header.cast::<u32>().sub(1)
}

/// Returns the free block immediately before `header` in slab order.
///
/// Only meaningful when `header` has its previous-free flag set.
unsafe fn get_previous_free(header: *mut Header) -> NonNull<Header> {
    let size = previous_free_size(header).read();
    let previous = header
        .cast::<u8>()
        .sub(size as usize + HEADER_SIZE)
        .cast::<Header>();
    assert_eq!((*previous).size() as u32, size, "corrupt boundary tag");
    assert!((*previous).is_free(), "boundary tag points at a live block");
    assert!(!(*previous).is_previous_free(), "adjacent free blocks");
    NonNull::new_unchecked(previous)
}

/// Sets the free flag on `header`, mirrors its size into its last payload
/// word, and flags the successor's previous-free bit.
unsafe fn mark_as_free(header: *mut Header) {
    (*header).set_free();
    if let Some(next) = (*header).next() {
        let next = next.as_ptr();
        (*next).set_previous_free();
        previous_free_size(next).write((*header).size() as u32);
    }
}

/// A stable cursor into a written value: the block holding the byte and
/// the byte's address within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    /// Block holding the position.
    pub header: NonNull<Header>,
    /// Byte address inside the block's payload.
    pub position: *mut u8,
}

/// Arena allocator for variable-length payloads.
///
/// # Example
///
/// ```rust
/// use granite_arena::StringArena;
/// use granite_common::stream::ByteOutputStream;
///
/// let mut arena = StringArena::new();
/// let mut stream = ByteOutputStream::new();
///
/// let start = arena.new_write(&mut stream, 16);
/// stream.append(&mut arena, b"a value longer than one block");
/// arena.finish_write(&stream, 0);
///
/// let mut input = unsafe { StringArena::prepare_read(start.header) };
/// let mut value = vec![0u8; 29];
/// input.read_bytes(&mut value);
/// assert_eq!(&value, b"a value longer than one block");
/// ```
pub struct StringArena {
    /// Upstream page pool supplying slabs and oversize memory.
    pool: AllocationPool,
    /// Size-classed free lists; heads are heap-pinned so the arena value
    /// itself may move while nodes hold offsets to them.
    free_lists: Box<[CompactDoubleList; NUM_FREE_LISTS]>,
    /// Bit `i` set iff `free_lists[i]` is non-empty.
    free_non_empty: u32,
    /// Number of free blocks across all lists.
    num_free: u64,
    /// Bytes in free blocks, headers included.
    free_bytes: u64,
    /// Payload bytes of all currently allocated blocks, oversize included.
    cumulative_bytes: i64,
    /// Gross bytes obtained through the oversize side path.
    size_from_pool: u64,
    /// Oversize allocations: header address to gross byte size.
    allocations_from_pool: HashMap<usize, usize>,
    /// Block of the write in progress, if any.
    current: Option<NonNull<Header>>,
}

impl StringArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: AllocationPool::new(),
            free_lists: Box::new(std::array::from_fn(|_| CompactDoubleList::new())),
            free_non_empty: 0,
            num_free: 0,
            free_bytes: 0,
            cumulative_bytes: 0,
            size_from_pool: 0,
            allocations_from_pool: HashMap::new(),
            current: None,
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocates a block of at least `size` payload bytes.
    ///
    /// With `exact_size` the block holds exactly `size` bytes (requests
    /// above [`MAX_ALLOC`] bypass the slabs and go straight to the pool);
    /// without it the arena may return a larger block, to be trimmed by
    /// the caller once the final length is known.
    pub fn allocate(&mut self, size: i32, exact_size: bool) -> NonNull<Header> {
        // SAFETY: all block manipulation stays inside slabs owned by the
        // arena's pool.
        unsafe { self.allocate_sized(size, exact_size, exact_size) }
    }

    unsafe fn allocate_sized(
        &mut self,
        size: i32,
        exact_size: bool,
        is_final_size: bool,
    ) -> NonNull<Header> {
        assert!(
            size >= 0 && (size as u32) <= Header::SIZE_MASK,
            "allocation size out of range"
        );
        if exact_size && size > MAX_ALLOC {
            let bytes = size as usize + HEADER_SIZE;
            let ptr = self
                .pool
                .allocate(bytes)
                .expect("upstream pool allocation failed");
            self.allocations_from_pool.insert(ptr.as_ptr() as usize, bytes);
            self.size_from_pool += bytes as u64;
            self.cumulative_bytes += size as i64;
            let header = ptr.cast::<Header>();
            header.as_ptr().write(Header::new(size));
            return header;
        }

        if let Some(header) = self.allocate_from_free_lists(size, exact_size, is_final_size) {
            return header;
        }
        self.new_slab(size);
        let header = self
            .allocate_from_free_lists(size, exact_size, is_final_size)
            .expect("free lists must satisfy the request after a new slab");
        debug_assert!((*header.as_ptr()).size() > 0);
        header
    }

    /// Obtains a new slab from the pool and seeds the free lists with it.
    unsafe fn new_slab(&mut self, size: i32) {
        let needed = round_up(size as usize + 2 * HEADER_SIZE, PAGE_SIZE).max(UNIT_SIZE as usize);
        let pages_needed = num_pages(needed);
        let (run, available) = if pages_needed > self.pool.largest_size_class() {
            warn!(bytes = size, "unusually large allocation request");
            let run = self
                .pool
                .allocate_fixed(needed)
                .expect("upstream pool allocation failed");
            (run.as_ptr(), page_bytes(pages_needed) - HEADER_SIZE)
        } else {
            self.pool
                .new_run(needed)
                .expect("upstream pool allocation failed");
            (
                self.pool.first_free_in_run(),
                self.pool.available_in_run() - HEADER_SIZE,
            )
        };
        debug_assert!(available > HEADER_SIZE);
        debug!(bytes = available, "new arena slab");

        run.add(available).cast::<u32>().write(Header::ARENA_END);

        // Seed the free lists with one block spanning the whole slab;
        // free() writes the boundary tags.
        let header = run.cast::<Header>();
        header.write(Header::new((available - HEADER_SIZE) as i32));
        self.cumulative_bytes += (available - HEADER_SIZE) as i64;
        self.free(NonNull::new_unchecked(header));
    }

    /// Picks a block from the free lists, or returns `None` if no class
    /// can serve the request.
    ///
    /// Scans the preferred class and larger non-empty ones first. Unless
    /// `must_have_size`, falls back to smaller classes and may return a
    /// block below `preferred`.
    unsafe fn allocate_from_free_lists(
        &mut self,
        preferred: i32,
        must_have_size: bool,
        is_final_size: bool,
    ) -> Option<NonNull<Header>> {
        let preferred = round_up_word(preferred.max(MIN_ALLOC));
        if self.num_free == 0 {
            return None;
        }

        let mut index = free_list_index_masked(preferred, self.free_non_empty);
        while (index as usize) < NUM_FREE_LISTS {
            if let Some(header) =
                self.allocate_from_free_list(preferred, must_have_size, is_final_size, index as usize)
            {
                return Some(header);
            }
            // Jump to the next larger non-empty class.
            index = (self.free_non_empty & !low_mask(index + 1)).trailing_zeros();
        }
        if must_have_size {
            return None;
        }

        // Settle for a smaller block; the caller handles short ranges.
        for index in (0..free_list_index(preferred)).rev() {
            if let Some(header) =
                self.allocate_from_free_list(preferred, false, is_final_size, index)
            {
                return Some(header);
            }
        }
        None
    }

    unsafe fn allocate_from_free_list(
        &mut self,
        preferred: i32,
        must_have_size: bool,
        is_final_size: bool,
        index: usize,
    ) -> Option<NonNull<Header>> {
        let head = ptr::addr_of_mut!(self.free_lists[index]);
        let mut found: Option<NonNull<Header>> = None;
        let mut largest: Option<NonNull<Header>> = None;
        let mut checked = 0usize;

        let mut node = (*head).next_ptr();
        while node != head {
            let header = NonNull::new_unchecked(node.cast::<Header>().sub(1));
            assert!((*header.as_ptr()).is_free(), "free list holds a live block");
            let size = (*header.as_ptr()).size();
            if size >= preferred {
                found = Some(header);
                break;
            }
            let largest_size = match largest {
                Some(block) => (*block.as_ptr()).size(),
                None => 0,
            };
            if size > largest_size {
                largest = Some(header);
            }
            checked += 1;
            if !must_have_size && checked > MAX_CHECKED_FOR_FIT {
                break;
            }
            node = (*node).next_ptr();
        }
        if !must_have_size && found.is_none() {
            found = largest;
        }
        let found = found?;

        self.num_free -= 1;
        self.free_bytes -= ((*found.as_ptr()).size() as usize + HEADER_SIZE) as u64;
        self.remove_from_free_list(found);

        if let Some(next) = (*found.as_ptr()).next() {
            (*next.as_ptr()).clear_previous_free();
        }
        self.cumulative_bytes += (*found.as_ptr()).size() as i64;
        if is_final_size {
            self.free_rest_of_block(found, preferred);
        }
        Some(found)
    }

    /// Unlinks a free block from its class list and clears its free flag.
    unsafe fn remove_from_free_list(&mut self, header: NonNull<Header>) {
        let header = header.as_ptr();
        assert!((*header).is_free());
        (*header).clear_free();
        let node = (*header).begin().cast::<CompactDoubleList>();
        (*node).remove();

        let index = free_list_index((*header).size());
        if self.free_lists[index].is_empty() {
            self.free_non_empty &= !(1 << index);
        }
    }

    /// Shrinks `header` to `keep_bytes` and frees the tail as its own
    /// block. Keeps the block whole when the tail would be below the
    /// minimum block size.
    unsafe fn free_rest_of_block(&mut self, header: NonNull<Header>, keep_bytes: i32) {
        let header = header.as_ptr();
        let keep = round_up_word(keep_bytes.max(MIN_ALLOC));
        let rest_size = (*header).size() - keep - HEADER_SIZE as i32;
        if rest_size <= MIN_ALLOC {
            return;
        }

        (*header).set_size(keep);
        // The split spends one header word that was payload before.
        self.cumulative_bytes -= HEADER_SIZE as i64;
        let rest = (*header).end().cast::<Header>();
        rest.write(Header::new(rest_size));
        self.free(NonNull::new_unchecked(rest));
    }

    /// Frees a block and every block chained after it, coalescing each
    /// with its slab neighbors.
    ///
    /// # Safety
    ///
    /// `header` must be a live block returned by this arena and not freed
    /// since, with no outstanding references into its payload.
    pub unsafe fn free(&mut self, header: NonNull<Header>) {
        let head = header.as_ptr();
        if (*head).size() > MAX_ALLOC
            && !self.pool.is_in_current_allocation(head.cast::<u8>())
            && self
                .allocations_from_pool
                .contains_key(&(head as usize))
        {
            // A standalone oversize allocation, not part of any slab.
            assert!(!(*head).is_continued(), "oversize blocks cannot be chained");
            self.free_to_pool(head, (*head).size() as usize + HEADER_SIZE);
            return;
        }

        let mut pending = Some(header);
        while let Some(block) = pending {
            let mut header = block.as_ptr();
            let continued = if (*header).is_continued() {
                let continued = (*header).next_continued();
                (*header).clear_continued();
                Some(continued)
            } else {
                None
            };

            assert!(!(*header).is_free(), "block freed twice");
            self.free_bytes += ((*header).size() as usize + HEADER_SIZE) as u64;
            self.cumulative_bytes -= (*header).size() as i64;

            if let Some(next) = (*header).next() {
                let next = next.as_ptr();
                assert!(!(*next).is_previous_free(), "stale boundary flag");
                if (*next).is_free() {
                    self.num_free -= 1;
                    self.remove_from_free_list(NonNull::new_unchecked(next));
                    (*header).set_size((*header).size() + (*next).size() + HEADER_SIZE as i32);
                    if let Some(after) = (*header).next() {
                        debug_assert!(!(*after.as_ptr()).is_free());
                    }
                }
            }
            if (*header).is_previous_free() {
                let previous = get_previous_free(header);
                self.remove_from_free_list(previous);
                let previous = previous.as_ptr();
                (*previous).set_size((*previous).size() + (*header).size() + HEADER_SIZE as i32);
                header = previous;
            } else {
                self.num_free += 1;
            }

            let index = free_list_index((*header).size());
            self.free_non_empty |= 1 << index;
            self.free_lists[index].insert((*header).begin().cast::<CompactDoubleList>());
            mark_as_free(header);

            pending = continued;
        }
    }

    /// Returns an oversize allocation to the pool.
    unsafe fn free_to_pool(&mut self, header: *mut Header, bytes: usize) {
        let recorded = self
            .allocations_from_pool
            .remove(&(header as usize))
            .expect("block was not allocated from the pool");
        assert_eq!(recorded, bytes, "oversize allocation size mismatch");
        self.size_from_pool -= bytes as u64;
        self.cumulative_bytes -= (bytes - HEADER_SIZE) as i64;
        self.pool.free(header.cast::<u8>(), bytes);
    }

    /// Returns the header of the block whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be the first payload byte of a live block.
    #[must_use]
    pub unsafe fn header_of(payload: *const u8) -> NonNull<Header> {
        NonNull::new_unchecked(payload.cast_mut().cast::<Header>().sub(1))
    }

    // =========================================================================
    // Write cursor
    // =========================================================================

    /// Starts a new value, publishing its first range to `stream`.
    ///
    /// Returns the position of the value's first byte, stable across
    /// later growth and trimming.
    ///
    /// # Panics
    ///
    /// Panics if a write is already in progress.
    pub fn new_write(&mut self, stream: &mut ByteOutputStream, preferred_size: i32) -> Position {
        assert!(
            self.current.is_none(),
            "finish the previous write before starting a new one"
        );
        // The first block is trimmed to the preferred size up front; the
        // value grows through chained ranges as needed.
        let header = unsafe { self.allocate_sized(preferred_size, false, true) };
        self.current = Some(header);

        // SAFETY: the block was just allocated from this arena.
        let (begin, size) = unsafe {
            let header = header.as_ptr();
            ((*header).begin(), (*header).size() as usize)
        };
        stream.set_range(ByteRange {
            buffer: begin,
            size,
            position: 0,
        });
        Position {
            header,
            position: begin,
        }
    }

    /// Reopens a finished value for appending at `position`, publishing
    /// the rest of its block to `stream`.
    ///
    /// Any chain previously hanging off the block is freed: the value is
    /// truncated at `position` before new bytes are appended.
    ///
    /// # Safety
    ///
    /// `position` must point into a live block of this arena.
    ///
    /// # Panics
    ///
    /// Panics if `position` lies outside its block's payload.
    pub unsafe fn extend_write(&mut self, position: Position, stream: &mut ByteOutputStream) {
        let header = position.header.as_ptr();
        let begin = (*header).begin();
        let end = (*header).end();
        assert!(
            position.position >= begin && position.position <= end,
            "extend_write position outside its block"
        );

        if (*header).is_continued() {
            let tail = (*header).next_continued();
            (*header).clear_continued();
            self.free(tail);
        }

        stream.set_range(ByteRange {
            buffer: position.position,
            size: end.offset_from(position.position) as usize,
            position: 0,
        });
        self.current = Some(position.header);
    }

    /// Chains a fresh block onto the value being written and returns its
    /// range.
    ///
    /// The last word of the current block becomes the link to the new
    /// block; its previous contents move to the new block's first word so
    /// the value's byte sequence is preserved. The returned range starts
    /// past that word.
    ///
    /// # Panics
    ///
    /// Panics if no write is in progress.
    pub fn new_range(&mut self, bytes: usize) -> ByteRange {
        self.new_range_impl(bytes, false)
    }

    /// Like [`new_range`](Self::new_range), but the returned block holds
    /// at least `bytes` contiguously.
    ///
    /// # Panics
    ///
    /// Panics if no write is in progress or `bytes` exceeds
    /// [`MAX_ALLOC`]: a chained block must live in a slab, never in the
    /// oversize side path.
    pub fn new_contiguous_range(&mut self, bytes: usize) -> ByteRange {
        assert!(
            bytes <= MAX_ALLOC as usize,
            "contiguous ranges cannot exceed MAX_ALLOC"
        );
        self.new_range_impl(bytes, true)
    }

    fn new_range_impl(&mut self, bytes: usize, contiguous: bool) -> ByteRange {
        let current = self
            .current
            .expect("call new_write or extend_write before new_range");
        let requested = i32::try_from(bytes)
            .unwrap_or(i32::MAX)
            .clamp(MIN_CONTIGUOUS, Header::SIZE_MASK as i32);
        // SAFETY: current is a live block of this arena; the new block is
        // freshly allocated.
        unsafe {
            let header = self.allocate_sized(requested, contiguous, contiguous);

            let current = current.as_ptr();
            let last_word = (*current).end().sub(WORD_SIZE).cast::<*mut Header>();
            // Preserve whatever the writer put in the current block's last
            // word: it moves to the new block's first word, ahead of the
            // published range.
            let stashed = last_word.read_unaligned();
            (*header.as_ptr())
                .begin()
                .cast::<*mut Header>()
                .write_unaligned(stashed);
            last_word.write_unaligned(header.as_ptr());
            (*current).set_continued();

            self.current = Some(header);
            let header = header.as_ptr();
            ByteRange {
                buffer: (*header).begin(),
                size: (*header).size() as usize,
                position: WORD_SIZE,
            }
        }
    }

    /// Completes the write in progress, trimming the unused tail of its
    /// last block (keeping `num_reserve_bytes` of headroom) and freeing
    /// any stale chain beyond the write position.
    ///
    /// Returns the position one past the last written byte.
    ///
    /// # Panics
    ///
    /// Panics if no write is in progress or the stream's write position
    /// lies outside the current block.
    pub fn finish_write(
        &mut self,
        stream: &ByteOutputStream,
        num_reserve_bytes: i32,
    ) -> Position {
        let header = self
            .current
            .expect("call new_write or extend_write before finish_write");
        let write_position = stream.write_position();

        // SAFETY: current is a live block of this arena.
        unsafe {
            let block = header.as_ptr();
            let begin = (*block).begin();
            assert!(
                write_position >= begin && write_position <= (*block).end(),
                "finish_write position outside the current block"
            );

            if (*block).is_continued() {
                let tail = (*block).next_continued();
                (*block).clear_continued();
                self.free(tail);
            }

            let written = write_position.offset_from(begin) as i32;
            self.free_rest_of_block(header, written + num_reserve_bytes);
        }
        self.current = None;
        Position {
            header,
            position: write_position,
        }
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Builds an input stream over the value starting at `begin`.
    ///
    /// Every non-terminal block contributes its payload minus the
    /// trailing continuation word; the terminal block contributes all of
    /// it.
    ///
    /// # Safety
    ///
    /// `begin` must head a live value of this arena, and the returned
    /// stream must not outlive the value.
    #[must_use]
    pub unsafe fn prepare_read(begin: NonNull<Header>) -> ByteInputStream {
        let mut ranges = Vec::new();
        let mut header = begin.as_ptr();
        loop {
            let continued = (*header).is_continued();
            let size = (*header).size() as usize;
            ranges.push(ByteRange {
                buffer: (*header).begin(),
                size: if continued { size - WORD_SIZE } else { size },
                position: 0,
            });
            if !continued {
                break;
            }
            header = (*header).next_continued().as_ptr();
        }
        ByteInputStream::new(ranges)
    }

    /// Returns the logical offset of `position` in the value starting at
    /// `header`, or `None` if the position is not inside the chain.
    ///
    /// # Safety
    ///
    /// `header` must head a live value of this arena.
    #[must_use]
    pub unsafe fn offset(header: NonNull<Header>, position: Position) -> Option<usize> {
        let mut walked = 0usize;
        let mut header = header.as_ptr();
        loop {
            let continued = (*header).is_continued();
            let length = (*header).size() as usize - if continued { WORD_SIZE } else { 0 };
            let begin = (*header).begin();
            if position.position >= begin && position.position <= begin.add(length) {
                return Some(walked + position.position.offset_from(begin) as usize);
            }
            if !continued {
                return None;
            }
            walked += length;
            header = (*header).next_continued().as_ptr();
        }
    }

    /// Returns the position at logical `offset` in the value starting at
    /// `header`, or `None` if the chain is shorter.
    ///
    /// # Safety
    ///
    /// `header` must head a live value of this arena.
    #[must_use]
    pub unsafe fn seek(header: NonNull<Header>, offset: usize) -> Option<Position> {
        let mut walked = 0usize;
        let mut header = header.as_ptr();
        loop {
            let continued = (*header).is_continued();
            let length = (*header).size() as usize - if continued { WORD_SIZE } else { 0 };
            let begin = (*header).begin();
            if offset <= walked + length {
                return Some(Position {
                    header: NonNull::new_unchecked(header),
                    position: begin.add(offset - walked),
                });
            }
            if !continued {
                return None;
            }
            walked += length;
            header = (*header).next_continued().as_ptr();
        }
    }

    /// Returns the bytes available in the value from `position` onward:
    /// the rest of its block plus the usable payload of every chained
    /// block after it.
    ///
    /// # Safety
    ///
    /// `position` must point into a live value of this arena.
    #[must_use]
    pub unsafe fn available(position: Position) -> usize {
        let mut header = position.header.as_ptr();
        let mut size = -(position.position.offset_from((*header).begin()) as i64);
        loop {
            let continued = (*header).is_continued();
            size += ((*header).size() as usize - if continued { WORD_SIZE } else { 0 }) as i64;
            if !continued {
                return size.max(0) as usize;
            }
            header = (*header).next_continued().as_ptr();
        }
    }

    /// Grows the value so at least `bytes` bytes are addressable from
    /// `position`, appending zeros as needed, and updates `position` to
    /// the equivalent location in the grown chain.
    ///
    /// Anything past `position` in the old chain is discarded.
    ///
    /// # Safety
    ///
    /// `position` must point into a live value of this arena.
    pub unsafe fn ensure_available(&mut self, bytes: usize, position: &mut Position) {
        if Self::available(*position) >= bytes {
            return;
        }

        let from_start = Self::offset(position.header, *position)
            .expect("position is not inside its own block");
        let mut stream = ByteOutputStream::new();
        self.extend_write(*position, &mut stream);

        const ZEROS: [u8; 128] = [0u8; 128];
        let mut remaining = bytes;
        while remaining > 0 {
            let step = remaining.min(ZEROS.len());
            stream.append(self, &ZEROS[..step]);
            remaining -= step;
        }
        self.finish_write(&stream, 0);

        // Growth may have moved the tail of the original block into a
        // chained one; re-derive the position from its logical offset.
        *position = Self::seek(position.header, from_start)
            .expect("grown chain no longer covers the position");
    }

    /// Returns `view` if its bytes are inline or already contiguous;
    /// otherwise copies them into `storage` and returns a view over it.
    ///
    /// # Safety
    ///
    /// A non-inline `view` must reference the start of a live value of
    /// this arena.
    #[must_use]
    pub unsafe fn contiguous_string(view: StringView, storage: &mut Vec<u8>) -> StringView {
        if view.is_inline() {
            return view;
        }
        let header = Self::header_of(view.data());
        if view.size() <= (*header.as_ptr()).size() as usize {
            return view;
        }

        let mut stream = Self::prepare_read(header);
        storage.resize(view.size(), 0);
        stream.read_bytes(storage);
        StringView::new(storage)
    }

    // =========================================================================
    // Statistics and verification
    // =========================================================================

    /// Returns the payload bytes of all currently allocated blocks.
    #[inline]
    #[must_use]
    pub const fn cumulative_bytes(&self) -> i64 {
        self.cumulative_bytes
    }

    /// Returns the bytes held in free blocks, headers included.
    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Returns the number of free blocks.
    #[inline]
    #[must_use]
    pub const fn num_free(&self) -> u64 {
        self.num_free
    }

    /// Returns the gross bytes held through the oversize side path.
    #[inline]
    #[must_use]
    pub const fn size_from_pool(&self) -> u64 {
        self.size_from_pool
    }

    /// Returns the free-list class bounds, including the padding lanes.
    #[inline]
    #[must_use]
    pub const fn free_list_sizes(&self) -> &[i32; NUM_FREE_LISTS + 1] {
        &FREE_LIST_SIZES
    }

    /// Returns the upstream pool.
    #[inline]
    #[must_use]
    pub const fn pool(&self) -> &AllocationPool {
        &self.pool
    }

    /// Walks every slab and every free list, asserting all structural
    /// invariants: block tiling, boundary tags, coalescing, class
    /// membership, the non-empty bitmap, and the free counters.
    ///
    /// # Panics
    ///
    /// Panics on any violation, and if oversize slabs exist (their runs
    /// are not introspectable).
    pub fn check_consistency(&self) {
        assert_eq!(
            self.pool.num_large_allocations(),
            0,
            "consistency check requires no oversize slabs"
        );

        let mut num_free = 0u64;
        let mut free_bytes = 0u64;
        for index in 0..self.pool.num_small_allocations() {
            let run = self.pool.allocation_at(index);
            let data = run.data();
            let size = run.byte_size() - HEADER_SIZE;
            // SAFETY: the run was formatted as a slab: blocks tile
            // [data, data + size) and the end marker sits at data + size.
            unsafe {
                let end = data.add(size);
                assert!((*end.cast::<Header>()).is_arena_end(), "missing end marker");

                let mut header = data.cast::<Header>();
                let mut previous_free = false;
                while header.cast::<u8>() != end {
                    assert!(header.cast::<u8>() < end, "block overruns its slab");
                    assert!((*header).end() <= end, "payload overruns its slab");
                    assert!((*header).size() > 0, "empty block");
                    assert_eq!(
                        (*header).is_previous_free(),
                        previous_free,
                        "previous-free flag out of sync"
                    );

                    if (*header).is_free() {
                        assert!(!previous_free, "adjacent free blocks not coalesced");
                        assert!(!(*header).is_continued(), "free block marked continued");
                        if (*header).next().is_some() {
                            let tag = (*header).end().cast::<u32>().sub(1).read();
                            assert_eq!(tag, (*header).size() as u32, "boundary tag mismatch");
                        }
                        num_free += 1;
                        free_bytes += ((*header).size() as usize + HEADER_SIZE) as u64;
                    } else if (*header).is_continued() {
                        let continued = (*header).next_continued();
                        assert!(
                            !(*continued.as_ptr()).is_free(),
                            "chain points at a free block"
                        );
                    }

                    previous_free = (*header).is_free();
                    header = (*header).end().cast::<Header>();
                }
            }
        }
        assert_eq!(num_free, self.num_free, "free block count drifted");
        assert_eq!(free_bytes, self.free_bytes, "free byte count drifted");

        let mut in_lists = 0u64;
        let mut bytes_in_lists = 0u64;
        let class_sizes = self.free_list_sizes();
        for index in 0..NUM_FREE_LISTS {
            let head = &self.free_lists[index];
            let has_bit = self.free_non_empty & (1 << index) != 0;
            assert_eq!(has_bit, !head.is_empty(), "bitmap out of sync");

            let head_ptr = head as *const CompactDoubleList as *mut CompactDoubleList;
            // SAFETY: list nodes live in free-block payloads of this
            // arena's slabs.
            unsafe {
                let mut node = head.next_ptr();
                while node != head_ptr {
                    let header = node.cast::<Header>().sub(1);
                    assert!((*header).is_free(), "free list holds a live block");
                    let size = (*header).size();
                    if index > 0 {
                        assert!(size >= class_sizes[index - 1], "block below its class");
                    }
                    assert!(size < class_sizes[index], "block above its class");
                    in_lists += 1;
                    bytes_in_lists += (size as usize + HEADER_SIZE) as u64;
                    node = (*node).next_ptr();
                }
            }
        }
        assert_eq!(in_lists, self.num_free, "free lists disagree with counter");
        assert_eq!(
            bytes_in_lists, self.free_bytes,
            "free lists disagree with byte counter"
        );
    }
}

impl StreamArena for StringArena {
    fn new_stream_range(&mut self, bytes: usize) -> ByteRange {
        self.new_range(bytes)
    }
}

impl Default for StringArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StringArena {
    fn drop(&mut self) {
        for (&ptr, &bytes) in &self.allocations_from_pool {
            // SAFETY: the side map records exactly the pointers and sizes
            // obtained from the pool's raw interface.
            unsafe {
                self.pool.free(ptr as *mut u8, bytes);
            }
        }
    }
}

impl std::fmt::Debug for StringArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringArena")
            .field("cumulative_bytes", &self.cumulative_bytes)
            .field("free_bytes", &self.free_bytes)
            .field("num_free", &self.num_free)
            .field("size_from_pool", &self.size_from_pool)
            .field("slabs", &self.pool.num_small_allocations())
            .finish()
    }
}
