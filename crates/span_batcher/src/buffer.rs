//! Growable Byte Buffer
//!
//! A single growable backing store from which callers reserve contiguous byte
//! windows. Windows are addressed by [`BufferHandle`] values (`offset`, `len`)
//! rather than borrowed slices, so many records can live in one allocation and
//! be referenced after the writer has moved on.
//!
//! # Handle lifetime
//!
//! Handles are plain indices. After [`GrowableBuffer::clear`] every previously
//! issued handle is stale: reading through it returns whatever the next writer
//! put there. Anything that must outlive the next `clear()` has to be copied out
//! with [`GrowableBuffer::materialize`] first.

/// Default initial capacity (bytes) for a fresh buffer.
pub const DEFAULT_INITIAL_CAPACITY: usize = 4096;

/// A byte window inside a [`GrowableBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferHandle {
    /// Start of the window.
    pub offset: usize,
    /// Number of bytes in the window.
    pub len: usize,
}

impl BufferHandle {
    /// One past the last byte of the window.
    #[inline]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Arena of bytes with doubling growth.
#[derive(Debug, Clone)]
pub struct GrowableBuffer {
    /// Backing store; `data.len()` is the capacity.
    data: Vec<u8>,
    /// Write cursor.
    position: usize,
}

impl GrowableBuffer {
    /// Creates a buffer with [`DEFAULT_INITIAL_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INITIAL_CAPACITY)
    }

    /// Creates a buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            position: 0,
        }
    }

    /// Reserves `len` bytes at the write cursor and advances it.
    ///
    /// Grows the backing store by `max(len, capacity)` when the remaining space
    /// is short, so capacity at least doubles but never ends up smaller than
    /// needed. Existing bytes are preserved across growth.
    ///
    /// # Panics
    ///
    /// Panics if the new capacity overflows `usize`.
    pub fn reserve(&mut self, len: usize) -> BufferHandle {
        if self.remaining() < len {
            self.grow(len);
        }
        let handle = BufferHandle {
            offset: self.position,
            len,
        };
        self.position += len;
        handle
    }

    fn grow(&mut self, len: usize) {
        let capacity = self.data.len();
        let new_capacity = capacity
            .checked_add(len.max(capacity))
            .expect("growable buffer capacity overflow");
        self.data.resize(new_capacity, 0);
    }

    /// Reserves a window and copies `bytes` into it.
    #[inline]
    pub fn put(&mut self, bytes: &[u8]) -> BufferHandle {
        let handle = self.reserve(bytes.len());
        self.data[handle.offset..handle.end()].copy_from_slice(bytes);
        handle
    }

    /// Returns a handle covering every byte written since `offset`.
    ///
    /// Used to coalesce the many small writes of one record into a single
    /// handle right after the record has been written.
    #[inline]
    pub fn handle_since(&self, offset: usize) -> BufferHandle {
        debug_assert!(offset <= self.position, "offset {} past cursor {}", offset, self.position);
        BufferHandle {
            offset,
            len: self.position - offset,
        }
    }

    /// Read access to a window.
    #[inline]
    pub fn slice(&self, handle: BufferHandle) -> &[u8] {
        &self.data[handle.offset..handle.end()]
    }

    /// Write access to a window.
    #[inline]
    pub fn slice_mut(&mut self, handle: BufferHandle) -> &mut [u8] {
        &mut self.data[handle.offset..handle.end()]
    }

    /// Copies a window out into an independent allocation.
    pub fn materialize(&self, handle: BufferHandle) -> Vec<u8> {
        self.slice(handle).to_vec()
    }

    /// Resets the write cursor without releasing the allocation.
    ///
    /// Every handle issued before this call becomes invalid.
    #[inline]
    pub fn clear(&mut self) {
        self.position = 0;
    }

    /// Drops the backing allocation, leaving an empty buffer.
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.position = 0;
    }

    /// Consumes the buffer, returning exactly the written bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.position);
        self.data
    }

    /// Written bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.position]
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.position == 0
    }
}

impl Default for GrowableBuffer {
    fn default() -> Self {
        Self::new()
    }
}
