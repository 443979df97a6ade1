//! Page-based allocation pool.
//!
//! The pool hands out three kinds of memory:
//!
//! - **Small runs** via [`AllocationPool::new_run`]: page-aligned
//!   allocations rounded up to a power-of-two number of pages, capped at
//!   [`LARGEST_CLASS_PAGES`]. Each small allocation is exactly one run.
//! - **Large runs** via [`AllocationPool::allocate_fixed`]: exact
//!   page-rounded allocations for requests above the largest size class.
//! - **Raw bytes** via [`AllocationPool::allocate`] /
//!   [`AllocationPool::free`]: byte-accounted allocations whose pointers
//!   the caller tracks.
//!
//! Runs are released when the pool is dropped. Raw allocations must be
//! returned by their owner before the pool drops.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use tracing::debug;

use crate::error::{MemoryError, MemoryResult};

/// Size of a memory page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Largest run size class, in pages (1 MiB).
pub const LARGEST_CLASS_PAGES: usize = 256;

/// Alignment of raw byte allocations.
const RAW_ALIGN: usize = 8;

/// Returns the number of pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn num_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Returns the byte size of `pages` pages.
#[inline]
#[must_use]
pub const fn page_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

/// A page-aligned contiguous run owned by the pool.
pub struct Allocation {
    data: NonNull<u8>,
    bytes: usize,
}

impl Allocation {
    /// Allocates a page-aligned run of `bytes` bytes.
    fn allocate(bytes: usize) -> MemoryResult<Self> {
        let layout = Layout::from_size_align(bytes, PAGE_SIZE)?;

        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { alloc::alloc(layout) };
        let data = NonNull::new(ptr).ok_or(MemoryError::OutOfMemory { bytes })?;

        Ok(Self { data, bytes })
    }

    /// Returns a pointer to the start of the run.
    #[inline]
    #[must_use]
    pub fn data(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Returns the byte size of the run.
    #[inline]
    #[must_use]
    pub const fn byte_size(&self) -> usize {
        self.bytes
    }

    /// Returns true if `ptr` falls inside the run.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.data.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.bytes
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.bytes, PAGE_SIZE).expect("invalid layout in run drop");

        // SAFETY: data was allocated with this layout.
        unsafe {
            alloc::dealloc(self.data.as_ptr(), layout);
        }
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("data", &self.data)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// A page-based pool of contiguous runs.
///
/// # Example
///
/// ```rust
/// use granite_common::memory::{AllocationPool, PAGE_SIZE};
///
/// let mut pool = AllocationPool::new();
/// pool.new_run(10 * PAGE_SIZE).expect("run allocation");
///
/// // Runs round up to the next power-of-two page count.
/// assert_eq!(pool.available_in_run(), 16 * PAGE_SIZE);
/// assert_eq!(pool.num_small_allocations(), 1);
/// ```
pub struct AllocationPool {
    /// Small runs, one per allocation, in allocation order.
    small: Vec<Allocation>,
    /// Large fixed runs that bypassed the size classes.
    large: Vec<Allocation>,
    /// Bytes outstanding through the raw allocate/free interface.
    raw_bytes: usize,
}

impl AllocationPool {
    /// Creates an empty pool.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            small: Vec::new(),
            large: Vec::new(),
            raw_bytes: 0,
        }
    }

    /// Allocates a new run of at least `bytes` bytes.
    ///
    /// The run size rounds up to the next power-of-two page count. Requests
    /// above [`LARGEST_CLASS_PAGES`] are refused; use
    /// [`allocate_fixed`](Self::allocate_fixed) for those.
    pub fn new_run(&mut self, bytes: usize) -> MemoryResult<()> {
        let pages = num_pages(bytes).next_power_of_two();
        if pages > LARGEST_CLASS_PAGES {
            return Err(MemoryError::RunTooLarge {
                pages,
                largest: LARGEST_CLASS_PAGES,
            });
        }

        let run = Allocation::allocate(page_bytes(pages))?;
        debug!(pages, "new pool run");
        self.small.push(run);
        Ok(())
    }

    /// Returns the first free byte of the most recent run.
    ///
    /// # Panics
    ///
    /// Panics if no run has been allocated.
    #[must_use]
    pub fn first_free_in_run(&self) -> *mut u8 {
        self.small.last().expect("no current run").data()
    }

    /// Returns the bytes available in the most recent run.
    ///
    /// # Panics
    ///
    /// Panics if no run has been allocated.
    #[must_use]
    pub fn available_in_run(&self) -> usize {
        self.small.last().expect("no current run").byte_size()
    }

    /// Returns true if `ptr` falls inside the most recent run.
    #[must_use]
    pub fn is_in_current_allocation(&self, ptr: *const u8) -> bool {
        self.small.last().map_or(false, |run| run.contains(ptr))
    }

    /// Allocates an exact page-rounded run outside the size classes.
    pub fn allocate_fixed(&mut self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        let run = Allocation::allocate(page_bytes(num_pages(bytes)))?;
        debug!(bytes = run.byte_size(), "new fixed pool run");
        let data = run.data;
        self.large.push(run);
        Ok(data)
    }

    /// Allocates `bytes` raw bytes, accounted until returned via
    /// [`free`](Self::free).
    pub fn allocate(&mut self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes, RAW_ALIGN)?;

        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { alloc::alloc(layout) };
        let data = NonNull::new(ptr).ok_or(MemoryError::OutOfMemory { bytes })?;

        self.raw_bytes += bytes;
        Ok(data)
    }

    /// Returns a raw allocation obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from a prior `allocate(bytes)` call on this pool
    /// with the same `bytes`, and must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8, bytes: usize) {
        debug_assert!(self.raw_bytes >= bytes);
        let layout =
            Layout::from_size_align(bytes, RAW_ALIGN).expect("invalid layout in raw free");
        alloc::dealloc(ptr, layout);
        self.raw_bytes -= bytes;
    }

    /// Returns the largest run size class, in pages.
    #[inline]
    #[must_use]
    pub const fn largest_size_class(&self) -> usize {
        LARGEST_CLASS_PAGES
    }

    /// Returns the number of small runs.
    #[inline]
    #[must_use]
    pub fn num_small_allocations(&self) -> usize {
        self.small.len()
    }

    /// Returns the `index`-th small run.
    #[must_use]
    pub fn allocation_at(&self, index: usize) -> &Allocation {
        &self.small[index]
    }

    /// Returns the number of large fixed runs.
    #[inline]
    #[must_use]
    pub fn num_large_allocations(&self) -> usize {
        self.large.len()
    }

    /// Returns the bytes outstanding through the raw interface.
    #[inline]
    #[must_use]
    pub const fn allocated_bytes(&self) -> usize {
        self.raw_bytes
    }

    /// Returns the total bytes held in runs.
    #[must_use]
    pub fn run_bytes(&self) -> usize {
        self.small
            .iter()
            .chain(self.large.iter())
            .map(Allocation::byte_size)
            .sum()
    }
}

impl Default for AllocationPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AllocationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationPool")
            .field("small_runs", &self.small.len())
            .field("large_runs", &self.large.len())
            .field("run_bytes", &self.run_bytes())
            .field("raw_bytes", &self.raw_bytes)
            .finish()
    }
}
