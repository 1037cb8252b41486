//! Hardware status register bits, as returned by the driver's wait call.

// ── Completion ───────────────────────────────────────────────────────────────

/// Scoring finished.
pub const COMPLETED: u32 = 1 << 0;

/// Performance counters in the wait record are valid.
pub const STATISTICS_VALID: u32 = 1 << 3;

// ── Faults ───────────────────────────────────────────────────────────────────

/// MMU translation fault.
pub const MMU_ERROR: u32 = 1 << 4;

/// DMA engine fault.
pub const DMA_ERROR: u32 = 1 << 5;

/// Completion interrupt without an active request.
pub const UNEXPECTED_COMPLETION: u32 = 1 << 6;

/// Descriptor referenced a virtual address outside the mapped range.
pub const VA_OUT_OF_RANGE: u32 = 1 << 7;

/// Descriptor parameter outside its legal range.
pub const PARAM_OUT_OF_RANGE: u32 = 1 << 8;

/// Union of all fault bits.
pub const FAULT_MASK: u32 =
    MMU_ERROR | DMA_ERROR | UNEXPECTED_COMPLETION | VA_OUT_OF_RANGE | PARAM_OUT_OF_RANGE;

// ── Warnings ─────────────────────────────────────────────────────────────────

/// Arithmetic saturation occurred in at least one output.
pub const SATURATION: u32 = 1 << 17;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_mask_excludes_warnings() {
        assert_eq!(FAULT_MASK & SATURATION, 0);
        assert_eq!(FAULT_MASK & COMPLETED, 0);
        assert_eq!(FAULT_MASK.count_ones(), 5);
    }
}
