//! Page-aligned host allocations shared with the device

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::OnceLock;

use gna_driver::{HostBuffer, MemoryId};

use crate::error::{GnaError, Result};

/// Alignment and granularity of every allocation.
pub const PAGE_SIZE: usize = 4096;

/// Round `size` up to whole pages.
#[must_use]
pub const fn page_align(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Zero-initialised, page-aligned allocation the device may read and write.
///
/// The device accesses the memory behind the host's back, so all host access
/// goes through bounds-checked copies and the pointer never leaves this type.
pub struct HostMemory {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
    memory_id: OnceLock<MemoryId>,
}

impl HostMemory {
    /// Allocate `size` bytes rounded up to whole pages.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::ResourceExhausted` for a zero size or when the
    /// allocator fails.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(GnaError::resource_exhausted("zero-sized allocation"));
        }
        let layout = Layout::from_size_align(page_align(size), PAGE_SIZE)
            .map_err(|e| GnaError::resource_exhausted(format!("invalid layout: {e}")))?;

        // SAFETY: layout has a non-zero size and a power-of-two alignment;
        // the block is released in Drop with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            GnaError::resource_exhausted(format!("cannot allocate {} bytes", layout.size()))
        })?;

        tracing::trace!("Allocated {size} bytes at {:#x}", ptr.as_ptr() as usize);
        Ok(Self {
            ptr,
            size,
            layout,
            memory_id: OnceLock::new(),
        })
    }

    /// Host address of the first byte.
    #[must_use]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Requested size.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Allocated size, a whole number of pages.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Whether `[address, address + len)` lies inside the allocation.
    #[must_use]
    pub fn contains(&self, address: usize, len: usize) -> bool {
        let start = self.address();
        address >= start
            && address
                .checked_add(len)
                .is_some_and(|end| end <= start + self.size)
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GnaError::out_of_bounds(format!(
                "{len} bytes at offset {offset:#x} exceed allocation of {} bytes",
                self.size
            ))),
        }
    }

    /// Copy bytes starting at `offset` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::MemoryOutOfBounds` if the range leaves the
    /// allocation.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // SAFETY: the range was checked against the allocation above and
        // `dst` is a distinct Rust allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy `src` into the allocation starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::MemoryOutOfBounds` if the range leaves the
    /// allocation.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // SAFETY: the range was checked against the allocation above and
        // `src` is a distinct Rust allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Copy of the requested bytes.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size];
        // SAFETY: size bytes are always in range.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), bytes.as_mut_ptr(), self.size);
        }
        bytes
    }

    /// Description handed to the driver for mapping.
    #[must_use]
    pub fn host_buffer(&self) -> HostBuffer {
        HostBuffer {
            address: self.address() as u64,
            size: self.capacity() as u64,
        }
    }

    /// Driver mapping of this allocation, once mapped.
    #[must_use]
    pub fn memory_id(&self) -> Option<MemoryId> {
        self.memory_id.get().copied()
    }

    /// Record the driver mapping. Returns `false` if one was already set.
    pub(crate) fn set_memory_id(&self, id: MemoryId) -> bool {
        self.memory_id.set(id).is_ok()
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("size", &self.size)
            .field("memory_id", &self.memory_id())
            .finish()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: ptr came from alloc_zeroed with self.layout and no copy of
        // it exists outside this value.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: HostMemory owns its block exclusively; moving it between threads
// does not invalidate the allocation.
unsafe impl Send for HostMemory {}

// SAFETY: every access copies through bounds-checked raw pointer calls and
// the metadata is immutable apart from the OnceLock. Requests serialise
// access to the buffers they use, like any device-shared memory.
unsafe impl Sync for HostMemory {}
