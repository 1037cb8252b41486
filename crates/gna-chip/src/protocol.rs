//! Submission record layout shared with the kernel driver.
//!
//! ```text
//! header (264 B)
//!   0x000 u32  control flags
//!   0x004 u32  buffer count
//!   0x008 256B config union
//!            xNN: u32 layer base, u32 layer count
//!            GMM: u32 config offset
//! buffer entries (32 B each)
//!   u64 memory id, u64 offset, u64 size, u64 patch count
//! patch entries, grouped per buffer in buffer order
//!   u64 offset, u64 size, inline data padded to 8 B
//! ```
//!
//! The whole record is padded to [`ALIGNMENT`].

/// Alignment of the whole record and of every patch entry.
pub const ALIGNMENT: usize = 8;

/// Size of the operation-specific config union.
pub const CONFIG_UNION_SIZE: usize = 256;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 8 + CONFIG_UNION_SIZE;

/// Size of one buffer entry.
pub const BUFFER_ENTRY_SIZE: usize = 32;

/// Size of a patch entry without its inline data.
pub const PATCH_HEADER_SIZE: usize = 16;

/// Identifier the driver never hands out for a valid mapping.
pub const FORBIDDEN_MEMORY_ID: u64 = u64::MAX;

/// Round `size` up to [`ALIGNMENT`].
#[must_use]
pub const fn align(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Size of one patch entry carrying `data_len` inline bytes.
#[must_use]
pub const fn patch_entry_size(data_len: usize) -> usize {
    PATCH_HEADER_SIZE + align(data_len)
}

/// Control-flag bit positions.
pub mod control {
    /// Active-list bit.
    pub const ACTIVE_LIST_SHIFT: u32 = 0;
    /// Mode field position.
    pub const MODE_SHIFT: u32 = 1;
    /// Mode field mask (after shifting).
    pub const MODE_MASK: u32 = 0b11;
    /// Mode value for a GMM submission.
    pub const MODE_GMM: u32 = 0;
    /// Mode value for an xNN submission.
    pub const MODE_XNN: u32 = 1;
    /// Hardware performance-counter encoding position.
    pub const HW_PERF_SHIFT: u32 = 3;
    /// Hardware performance-counter encoding mask (after shifting).
    pub const HW_PERF_MASK: u32 = 0xFF;
    /// Bits that must be zero.
    pub const RESERVED_MASK: u32 = !((1 << 11) - 1);
}

/// Driver parameter identifiers for the GET_PARAM query.
pub mod param {
    /// Raw device version code.
    pub const DEVICE_ID: u64 = 1;
    /// Recovery timeout in seconds.
    pub const RECOVERY_TIMEOUT: u64 = 2;
    /// Input buffer size in KiB.
    pub const INPUT_BUFFER_S: u64 = 3;
    /// Driver interface version.
    pub const DDI_VERSION: u64 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_aligned() {
        assert_eq!(HEADER_SIZE, 264);
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
        assert_eq!(BUFFER_ENTRY_SIZE % ALIGNMENT, 0);
    }

    #[test]
    fn patch_entries_pad_inline_data() {
        assert_eq!(patch_entry_size(1), 24);
        assert_eq!(patch_entry_size(4), 24);
        assert_eq!(patch_entry_size(8), 24);
        assert_eq!(patch_entry_size(9), 32);
    }

    #[test]
    fn reserved_bits_follow_perf_field() {
        let used = (1 << control::ACTIVE_LIST_SHIFT)
            | (control::MODE_MASK << control::MODE_SHIFT)
            | (control::HW_PERF_MASK << control::HW_PERF_SHIFT);
        assert_eq!(used & control::RESERVED_MASK, 0);
        assert_eq!(used | control::RESERVED_MASK, u32::MAX);
    }
}
