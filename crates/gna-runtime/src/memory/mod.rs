//! Memory region tracking
//!
//! [`HostMemory`] is one page-aligned allocation, [`MemoryArena`] the set of
//! allocations a device hands out, and [`MemoryContainer`] an ordered
//! selection of allocations that forms one device address space.

mod arena;
mod container;
mod host;

use std::sync::Arc;

pub use arena::MemoryArena;
pub use container::{MemoryContainer, MemoryRegion};
pub use host::{page_align, HostMemory, PAGE_SIZE};

use crate::error::Result;

/// A validated buffer inside one allocation.
#[derive(Debug, Clone)]
pub struct BufferRef {
    memory: Arc<HostMemory>,
    offset: usize,
    len: usize,
}

impl BufferRef {
    pub(crate) fn new(memory: Arc<HostMemory>, offset: usize, len: usize) -> Self {
        Self {
            memory,
            offset,
            len,
        }
    }

    /// Allocation holding the buffer.
    #[must_use]
    pub const fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }

    /// Host address of the first byte.
    #[must_use]
    pub fn address(&self) -> usize {
        self.memory.address() + self.offset
    }

    /// Offset inside the allocation.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether two buffers share at least one byte.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let (a, b) = (self.address(), other.address());
        a < b + other.len && b < a + self.len
    }

    /// Copy the buffer into `dst`, resizing it to fit.
    ///
    /// # Errors
    ///
    /// Propagates bounds failures of the allocation.
    pub fn read_into(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.resize(self.len, 0);
        self.memory.read(self.offset, dst)
    }

    /// Overwrite the start of the buffer with `src`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::MemoryOutOfBounds` if `src` is longer than the
    /// buffer.
    pub fn write(&self, src: &[u8]) -> Result<()> {
        if src.len() > self.len {
            return Err(crate::error::GnaError::out_of_bounds(format!(
                "{} bytes do not fit a {}-byte buffer",
                src.len(),
                self.len
            )));
        }
        self.memory.write(self.offset, src)
    }

    /// Same buffer with a new length.
    #[must_use]
    pub fn with_len(&self, len: usize) -> Self {
        Self::new(Arc::clone(&self.memory), self.offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_detection() {
        let mut arena = MemoryArena::new();
        let memory = arena.allocate(64).unwrap();
        let base = memory.address();
        let a = arena.resolve(base, 16).unwrap();
        let b = arena.resolve(base + 15, 4).unwrap();
        let c = arena.resolve(base + 16, 4).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn buffer_round_trip() {
        let mut arena = MemoryArena::new();
        let memory = arena.allocate(32).unwrap();
        let buffer = arena.resolve(memory.address() + 4, 4).unwrap();
        buffer.write(&[9, 8, 7, 6]).unwrap();
        let mut out = Vec::new();
        buffer.read_into(&mut out).unwrap();
        assert_eq!(out, vec![9, 8, 7, 6]);
        assert!(buffer.write(&[0; 5]).is_err());
    }
}
