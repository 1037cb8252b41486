//! Ordered set of allocations forming one device address space
//!
//! The device sees the regions of a container back to back, each starting
//! on a page boundary, in insertion order. A buffer's device address is its
//! region's page-aligned offset plus its offset inside the allocation.

use std::sync::Arc;

use super::host::{page_align, HostMemory};
use crate::error::{GnaError, Result};

/// One allocation placed in a container.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    memory: Arc<HostMemory>,
    offset: u64,
    aligned_offset: u64,
}

impl MemoryRegion {
    /// The allocation.
    #[must_use]
    pub const fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }

    /// Offset with regions packed back to back.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset with every region starting on a page boundary.
    #[must_use]
    pub const fn aligned_offset(&self) -> u64 {
        self.aligned_offset
    }
}

/// Allocations in device address order.
#[derive(Debug, Clone, Default)]
pub struct MemoryContainer {
    regions: Vec<MemoryRegion>,
    size: u64,
    aligned_size: u64,
}

impl MemoryContainer {
    /// Empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allocation at the end. Adding one already present is a no-op.
    pub fn emplace(&mut self, memory: &Arc<HostMemory>) {
        if self.position(memory.address()).is_some() {
            return;
        }
        self.regions.push(MemoryRegion {
            memory: Arc::clone(memory),
            offset: self.size,
            aligned_offset: self.aligned_size,
        });
        self.size += memory.size() as u64;
        self.aligned_size += page_align(memory.size()) as u64;
    }

    /// Add every allocation of `other`, keeping its order.
    pub fn append(&mut self, other: &Self) {
        for region in &other.regions {
            self.emplace(&region.memory);
        }
    }

    fn position(&self, address: usize) -> Option<usize> {
        self.regions
            .iter()
            .position(|region| region.memory.address() == address)
    }

    /// Region holding `address`.
    #[must_use]
    pub fn region_of(&self, address: usize) -> Option<&MemoryRegion> {
        self.regions.iter().find(|region| {
            let start = region.memory.address();
            (start..start + region.memory.size()).contains(&address)
        })
    }

    /// Device offset of the buffer `[address, address + size)`, relative to
    /// `initial`. `None` if no region holds `address`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::MemoryOutOfBounds` if the buffer starts inside a
    /// region but does not end inside it.
    pub fn buffer_offset(
        &self,
        address: usize,
        size: usize,
        aligned: bool,
        initial: u64,
    ) -> Result<Option<u64>> {
        let Some(region) = self.region_of(address) else {
            return Ok(None);
        };
        if !region.memory.contains(address, size) {
            return Err(GnaError::out_of_bounds(format!(
                "buffer {address:#x}+{size} extends past allocation {:#x}+{}",
                region.memory.address(),
                region.memory.size()
            )));
        }
        let base = if aligned {
            region.aligned_offset
        } else {
            region.offset
        };
        let inner = (address - region.memory.address()) as u64;
        Ok(Some(initial + base + inner))
    }

    /// Copy every region into `dst` at its page-aligned offset.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::MemoryOutOfBounds` if `dst` is smaller than the
    /// aligned total.
    pub fn copy_data(&self, dst: &mut [u8]) -> Result<usize> {
        let needed = usize::try_from(self.aligned_size)
            .map_err(|_| GnaError::out_of_bounds("container exceeds address space"))?;
        if dst.len() < needed {
            return Err(GnaError::out_of_bounds(format!(
                "destination of {} bytes cannot hold {needed} bytes of regions",
                dst.len()
            )));
        }
        for region in &self.regions {
            let start = usize::try_from(region.aligned_offset)
                .map_err(|_| GnaError::out_of_bounds("region offset exceeds address space"))?;
            let size = region.memory.size();
            region.memory.read(0, &mut dst[start..start + size])?;
        }
        Ok(needed)
    }

    /// Total size, packed or page-aligned.
    #[must_use]
    pub const fn total_size(&self, aligned: bool) -> u64 {
        if aligned {
            self.aligned_size
        } else {
            self.size
        }
    }

    /// Regions in insertion order.
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the container holds no region.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(size: usize) -> Arc<HostMemory> {
        Arc::new(HostMemory::new(size).unwrap())
    }

    #[test]
    fn emplace_is_idempotent() {
        let a = memory(100);
        let mut container = MemoryContainer::new();
        container.emplace(&a);
        container.emplace(&a);
        assert_eq!(container.len(), 1);
        assert_eq!(container.total_size(false), 100);
        assert_eq!(container.total_size(true), 4096);
    }

    #[test]
    fn offsets_follow_insertion_order() {
        let (a, b) = (memory(100), memory(5000));
        let mut container = MemoryContainer::new();
        container.emplace(&a);
        container.emplace(&b);

        let b_at = b.address() + 16;
        assert_eq!(container.buffer_offset(b_at, 8, true, 0).unwrap(), Some(4096 + 16));
        assert_eq!(container.buffer_offset(b_at, 8, false, 0).unwrap(), Some(100 + 16));
        assert_eq!(
            container.buffer_offset(a.address(), 4, true, 0x100).unwrap(),
            Some(0x100)
        );
    }

    #[test]
    fn offsets_are_stable_after_append() {
        let (a, b, c) = (memory(10), memory(20), memory(30));
        let mut model = MemoryContainer::new();
        model.emplace(&a);
        model.emplace(&b);
        let before = model.buffer_offset(b.address(), 20, true, 0).unwrap();

        let mut request = MemoryContainer::new();
        request.emplace(&b);
        request.emplace(&c);
        let mut combined = model.clone();
        combined.append(&request);

        assert_eq!(combined.len(), 3);
        assert_eq!(combined.buffer_offset(b.address(), 20, true, 0).unwrap(), before);
        assert_eq!(
            combined.buffer_offset(c.address(), 30, true, 0).unwrap(),
            Some(2 * 4096)
        );
    }

    #[test]
    fn unknown_and_overlong_buffers() {
        let a = memory(64);
        let other = memory(64);
        let mut container = MemoryContainer::new();
        container.emplace(&a);
        assert_eq!(container.buffer_offset(other.address(), 4, true, 0).unwrap(), None);
        assert!(container.buffer_offset(a.address() + 60, 8, true, 0).is_err());
    }

    #[test]
    fn copy_data_checks_destination() {
        let (a, b) = (memory(4), memory(4));
        a.write(0, &[1, 2, 3, 4]).unwrap();
        b.write(0, &[5, 6, 7, 8]).unwrap();
        let mut container = MemoryContainer::new();
        container.emplace(&a);
        container.emplace(&b);

        let mut small = vec![0u8; 4096];
        assert!(container.copy_data(&mut small).is_err());

        let mut image = vec![0u8; 8192];
        assert_eq!(container.copy_data(&mut image).unwrap(), 8192);
        assert_eq!(&image[..4], &[1, 2, 3, 4]);
        assert_eq!(&image[4096..4100], &[5, 6, 7, 8]);
    }
}
