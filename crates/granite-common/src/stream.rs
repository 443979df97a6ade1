//! Byte streams over chains of memory ranges.
//!
//! Values produced by Granite's operators may span several non-contiguous
//! memory ranges. This module provides the cursor machinery to write into
//! and read out of such chains:
//!
//! - [`ByteRange`] — a raw window into externally owned memory with a
//!   cursor
//! - [`ByteOutputStream`] — appends bytes across ranges, asking a
//!   [`StreamArena`] for a continuation range when the active one fills
//! - [`ByteInputStream`] — reads bytes back across a prepared range chain
//!
//! Streams hold raw pointers into memory owned by their backing arena and
//! are single-actor objects: they are neither `Send` nor `Sync`, and a
//! stream must not outlive the memory its ranges describe.

use std::ptr;

/// A window into externally owned memory with a write/read cursor.
///
/// `position` is the cursor offset within `buffer`; bytes before it have
/// been consumed (written or read), bytes between it and `size` are
/// available.
#[derive(Clone, Copy, Debug)]
pub struct ByteRange {
    /// Start of the range.
    pub buffer: *mut u8,
    /// Usable bytes in the range.
    pub size: usize,
    /// Cursor offset within the range.
    pub position: usize,
}

impl ByteRange {
    /// Returns the bytes remaining between the cursor and the end.
    #[inline]
    #[must_use]
    pub const fn available(&self) -> usize {
        self.size - self.position
    }
}

/// Source of continuation ranges for a [`ByteOutputStream`].
///
/// Implemented by allocators that can extend an in-progress value with a
/// new block when the active range fills up.
pub trait StreamArena {
    /// Returns a fresh range with room for roughly `bytes` more bytes.
    ///
    /// The returned range may be smaller or larger than requested; its
    /// `position` marks where the stream should continue writing.
    fn new_stream_range(&mut self, bytes: usize) -> ByteRange;
}

/// A write cursor over a growing chain of ranges.
///
/// # Example
///
/// ```rust
/// use granite_common::stream::{ByteOutputStream, ByteRange, StreamArena};
///
/// struct NoGrowth;
/// impl StreamArena for NoGrowth {
///     fn new_stream_range(&mut self, _bytes: usize) -> ByteRange {
///         panic!("fixed buffer exhausted");
///     }
/// }
///
/// let mut buffer = [0u8; 16];
/// let mut stream = ByteOutputStream::new();
/// stream.set_range(ByteRange {
///     buffer: buffer.as_mut_ptr(),
///     size: buffer.len(),
///     position: 0,
/// });
///
/// stream.append(&mut NoGrowth, b"granite");
/// assert_eq!(&buffer[..7], b"granite");
/// ```
#[derive(Debug, Default)]
pub struct ByteOutputStream {
    /// Ranges in write order; the last one is active.
    ranges: Vec<ByteRange>,
}

impl ByteOutputStream {
    /// Creates a stream with no active range.
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Resets the stream to a single active range.
    pub fn set_range(&mut self, range: ByteRange) {
        self.ranges.clear();
        self.ranges.push(range);
    }

    /// Returns the address of the write cursor in the active range.
    ///
    /// # Panics
    ///
    /// Panics if no range has been set.
    #[must_use]
    pub fn write_position(&self) -> *mut u8 {
        let range = self.ranges.last().expect("no active range");
        // SAFETY: position never exceeds size, so the cursor stays inside
        // the range (one-past-the-end at most).
        unsafe { range.buffer.add(range.position) }
    }

    /// Appends `data`, requesting continuation ranges from `arena` as the
    /// active range fills.
    ///
    /// # Panics
    ///
    /// Panics if no range has been set.
    pub fn append(&mut self, arena: &mut dyn StreamArena, mut data: &[u8]) {
        assert!(!self.ranges.is_empty(), "no active range");
        while !data.is_empty() {
            let range = self.ranges.last_mut().expect("no active range");
            let room = range.available();
            if room == 0 {
                let next = arena.new_stream_range(data.len());
                self.ranges.push(next);
                continue;
            }

            let count = room.min(data.len());
            // SAFETY: the cursor and count stay inside the range, and data
            // does not alias arena memory.
            unsafe {
                ptr::copy_nonoverlapping(data.as_ptr(), range.buffer.add(range.position), count);
            }
            range.position += count;
            data = &data[count..];
        }
    }

    /// Returns the ranges written so far.
    #[must_use]
    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }
}

/// A read cursor over a prepared chain of ranges.
///
/// # Example
///
/// ```rust
/// use granite_common::stream::{ByteInputStream, ByteRange};
///
/// let mut first = *b"gran";
/// let mut second = *b"ite";
/// let mut stream = ByteInputStream::new(vec![
///     ByteRange { buffer: first.as_mut_ptr(), size: 4, position: 0 },
///     ByteRange { buffer: second.as_mut_ptr(), size: 3, position: 0 },
/// ]);
///
/// let mut out = [0u8; 7];
/// stream.read_bytes(&mut out);
/// assert_eq!(&out, b"granite");
/// assert_eq!(stream.remaining(), 0);
/// ```
#[derive(Debug, Default)]
pub struct ByteInputStream {
    ranges: Vec<ByteRange>,
    current: usize,
}

impl ByteInputStream {
    /// Creates a stream positioned at the start of `ranges`.
    #[must_use]
    pub fn new(ranges: Vec<ByteRange>) -> Self {
        Self { ranges, current: 0 }
    }

    /// Replaces the input with a new chain of ranges and rewinds.
    pub fn reset_input(&mut self, ranges: Vec<ByteRange>) {
        self.ranges = ranges;
        self.current = 0;
    }

    /// Returns the bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.ranges
            .iter()
            .skip(self.current)
            .map(ByteRange::available)
            .sum()
    }

    /// Reads exactly `out.len()` bytes into `out`.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `out.len()` bytes remain.
    pub fn read_bytes(&mut self, out: &mut [u8]) {
        assert!(out.len() <= self.remaining(), "read past end of input");
        let mut filled = 0;
        while filled < out.len() {
            let range = &mut self.ranges[self.current];
            let room = range.available();
            if room == 0 {
                self.current += 1;
                continue;
            }

            let count = room.min(out.len() - filled);
            // SAFETY: the cursor and count stay inside the range; out is a
            // distinct local buffer.
            unsafe {
                ptr::copy_nonoverlapping(
                    range.buffer.add(range.position),
                    out.as_mut_ptr().add(filled),
                    count,
                );
            }
            range.position += count;
            filled += count;
        }
    }

    /// Skips `count` bytes.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `count` bytes remain.
    pub fn skip(&mut self, count: usize) {
        assert!(count <= self.remaining(), "skip past end of input");
        let mut left = count;
        while left > 0 {
            let range = &mut self.ranges[self.current];
            let room = range.available();
            if room == 0 {
                self.current += 1;
                continue;
            }

            let step = room.min(left);
            range.position += step;
            left -= step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecArena {
        chunks: Vec<Box<[u8]>>,
        chunk_size: usize,
    }

    impl VecArena {
        fn new(chunk_size: usize) -> Self {
            Self {
                chunks: Vec::new(),
                chunk_size,
            }
        }
    }

    impl StreamArena for VecArena {
        fn new_stream_range(&mut self, _bytes: usize) -> ByteRange {
            self.chunks
                .push(vec![0u8; self.chunk_size].into_boxed_slice());
            let chunk = self.chunks.last_mut().expect("chunk just pushed");
            ByteRange {
                buffer: chunk.as_mut_ptr(),
                size: chunk.len(),
                position: 0,
            }
        }
    }

    #[test]
    fn test_append_within_range() {
        let mut buffer = [0u8; 8];
        let mut stream = ByteOutputStream::new();
        stream.set_range(ByteRange {
            buffer: buffer.as_mut_ptr(),
            size: buffer.len(),
            position: 0,
        });

        let mut arena = VecArena::new(8);
        stream.append(&mut arena, b"abc");
        stream.append(&mut arena, b"de");

        assert_eq!(&buffer[..5], b"abcde");
        assert!(arena.chunks.is_empty());
        assert_eq!(stream.write_position() as usize, buffer.as_ptr() as usize + 5);
    }

    #[test]
    fn test_append_grows_across_ranges() {
        let mut buffer = [0u8; 4];
        let mut stream = ByteOutputStream::new();
        stream.set_range(ByteRange {
            buffer: buffer.as_mut_ptr(),
            size: buffer.len(),
            position: 0,
        });

        let mut arena = VecArena::new(4);
        stream.append(&mut arena, b"0123456789");

        assert_eq!(&buffer, b"0123");
        assert_eq!(arena.chunks.len(), 2);
        assert_eq!(&arena.chunks[0][..], b"4567");
        assert_eq!(&arena.chunks[1][..2], b"89");
    }

    #[test]
    fn test_read_across_ranges() {
        let mut a = *b"hello ";
        let mut b = *b"world";
        let mut stream = ByteInputStream::new(vec![
            ByteRange {
                buffer: a.as_mut_ptr(),
                size: a.len(),
                position: 0,
            },
            ByteRange {
                buffer: b.as_mut_ptr(),
                size: b.len(),
                position: 0,
            },
        ]);

        assert_eq!(stream.remaining(), 11);
        let mut head = [0u8; 3];
        stream.read_bytes(&mut head);
        assert_eq!(&head, b"hel");

        let mut rest = [0u8; 8];
        stream.read_bytes(&mut rest);
        assert_eq!(&rest, b"lo world");
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn test_skip() {
        let mut a = *b"abcdef";
        let mut stream = ByteInputStream::new(vec![ByteRange {
            buffer: a.as_mut_ptr(),
            size: a.len(),
            position: 0,
        }]);

        stream.skip(4);
        let mut out = [0u8; 2];
        stream.read_bytes(&mut out);
        assert_eq!(&out, b"ef");
    }

    #[test]
    #[should_panic(expected = "read past end of input")]
    fn test_read_past_end_panics() {
        let mut a = *b"ab";
        let mut stream = ByteInputStream::new(vec![ByteRange {
            buffer: a.as_mut_ptr(),
            size: a.len(),
            position: 0,
        }]);

        let mut out = [0u8; 3];
        stream.read_bytes(&mut out);
    }

    #[test]
    fn test_write_position_tracks_active_range() {
        let mut buffer = [0u8; 2];
        let mut stream = ByteOutputStream::new();
        stream.set_range(ByteRange {
            buffer: buffer.as_mut_ptr(),
            size: buffer.len(),
            position: 0,
        });

        let mut arena = VecArena::new(16);
        stream.append(&mut arena, b"abcd");

        // The cursor now lives in the arena-provided range.
        let chunk_start = arena.chunks[0].as_ptr() as usize;
        assert_eq!(stream.write_position() as usize, chunk_start + 2);
    }
}
