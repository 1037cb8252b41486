//! Registry of live allocations, keyed by host address

use std::collections::BTreeMap;
use std::sync::Arc;

use super::host::HostMemory;
use super::BufferRef;
use crate::error::{GnaError, Result};

/// Every allocation made through a device.
#[derive(Debug, Default)]
pub struct MemoryArena {
    allocations: BTreeMap<usize, Arc<HostMemory>>,
}

impl MemoryArena {
    /// Empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and register `size` bytes.
    ///
    /// # Errors
    ///
    /// Propagates allocation failures.
    pub fn allocate(&mut self, size: usize) -> Result<Arc<HostMemory>> {
        let memory = Arc::new(HostMemory::new(size)?);
        self.allocations.insert(memory.address(), Arc::clone(&memory));
        Ok(memory)
    }

    /// Remove the allocation starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for an unknown address and
    /// `GnaError::MemoryInUse` while a model, configuration or request still
    /// holds the allocation.
    pub fn free(&mut self, address: usize) -> Result<Arc<HostMemory>> {
        let memory = self
            .allocations
            .get(&address)
            .ok_or_else(|| GnaError::invalid_identifier("memory", address as u64))?;
        if Arc::strong_count(memory) > 1 {
            return Err(GnaError::MemoryInUse { address });
        }
        self.allocations
            .remove(&address)
            .ok_or_else(|| GnaError::invalid_identifier("memory", address as u64))
    }

    /// Allocation starting at `address`.
    #[must_use]
    pub fn get(&self, address: usize) -> Option<&Arc<HostMemory>> {
        self.allocations.get(&address)
    }

    /// Resolve a buffer to its allocation, checking the whole range.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::MemoryOutOfBounds` if `address` is not inside any
    /// allocation or the buffer runs past its end.
    pub fn resolve(&self, address: usize, len: usize) -> Result<BufferRef> {
        let (_, memory) = self
            .allocations
            .range(..=address)
            .next_back()
            .filter(|(start, memory)| address < **start + memory.size())
            .ok_or_else(|| {
                GnaError::out_of_bounds(format!("{address:#x} is not inside any allocation"))
            })?;
        if !memory.contains(address, len) {
            return Err(GnaError::out_of_bounds(format!(
                "buffer {address:#x}+{len} runs past allocation {:#x}+{}",
                memory.address(),
                memory.size()
            )));
        }
        Ok(BufferRef::new(Arc::clone(memory), address - memory.address(), len))
    }

    /// All allocations, by address.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<HostMemory>> {
        self.allocations.values()
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Whether nothing is allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
