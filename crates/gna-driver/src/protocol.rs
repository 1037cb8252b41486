//! Submission record encoding.
//!
//! A [`Submission`] is the in-memory form of one scoring request as the
//! driver sees it: control flags, the run configuration, the list of mapped
//! buffers the device may touch and, per buffer, the patches to apply before
//! scoring. [`Submission::encode`] produces the exact wire record described
//! in [`gna_chip::protocol`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gna_chip::protocol::{
    self as wire, control, ALIGNMENT, BUFFER_ENTRY_SIZE, CONFIG_UNION_SIZE, HEADER_SIZE,
    PATCH_HEADER_SIZE,
};

use crate::error::{DriverError, Result};
use crate::interface::MemoryId;

// ── Control flags ────────────────────────────────────────────────────────────

/// Request-level control flags. The mode bits follow from [`SubmitConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlFlags {
    /// At least one layer of the run uses an active list.
    pub active_list_on: bool,
    /// Hardware performance-counter selection.
    pub hw_perf_encoding: u8,
}

/// Run configuration carried in the header union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitConfig {
    /// xNN run starting at a descriptor slot.
    Xnn {
        /// MMU offset of the first descriptor.
        layer_base: u32,
        /// Number of layers in the run.
        layer_count: u32,
    },
    /// Single legacy GMM layer.
    Gmm {
        /// MMU offset of the GMM config record.
        config_offset: u32,
    },
}

impl SubmitConfig {
    const fn mode_bits(self) -> u32 {
        match self {
            Self::Xnn { .. } => control::MODE_XNN,
            Self::Gmm { .. } => control::MODE_GMM,
        }
    }
}

// ── Buffers and patches ──────────────────────────────────────────────────────

/// Inline value of one patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchValue {
    /// One byte.
    U8(u8),
    /// Little-endian 16-bit word.
    U16(u16),
    /// Little-endian 32-bit word.
    U32(u32),
}

impl PatchValue {
    /// Size of the inline data.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U32(_) => 4,
        }
    }

    /// Value widened to `u32`.
    #[must_use]
    pub const fn get(self) -> u32 {
        match self {
            Self::U8(v) => v as u32,
            Self::U16(v) => v as u32,
            Self::U32(v) => v,
        }
    }

    fn put(self, buf: &mut BytesMut) {
        match self {
            Self::U8(v) => buf.put_u8(v),
            Self::U16(v) => buf.put_u16_le(v),
            Self::U32(v) => buf.put_u32_le(v),
        }
    }
}

/// One `(offset, value)` write into a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPatch {
    /// Byte offset within the buffer.
    pub offset: u64,
    /// Value to store.
    pub value: PatchValue,
}

impl MemoryPatch {
    /// Create a patch.
    #[must_use]
    pub const fn new(offset: u64, value: PatchValue) -> Self {
        Self { offset, value }
    }

    const fn encoded_len(&self) -> usize {
        wire::patch_entry_size(self.value.size())
    }
}

/// A mapped buffer visible to the device for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    /// Mapping identifier.
    pub memory_id: MemoryId,
    /// Start of the visible window within the mapping.
    pub offset: u64,
    /// Size of the visible window.
    pub size: u64,
    /// Patches applied to this buffer before scoring.
    pub patches: Vec<MemoryPatch>,
}

impl BufferEntry {
    /// Whole-mapping entry without patches.
    #[must_use]
    pub const fn whole(memory_id: MemoryId, size: u64) -> Self {
        Self {
            memory_id,
            offset: 0,
            size,
            patches: Vec::new(),
        }
    }
}

// ── Submission ───────────────────────────────────────────────────────────────

/// Complete submission record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Control flags.
    pub flags: ControlFlags,
    /// Run configuration.
    pub config: SubmitConfig,
    /// Buffers in MMU order.
    pub buffers: Vec<BufferEntry>,
}

impl Submission {
    /// Exact encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let patches: usize = self
            .buffers
            .iter()
            .flat_map(|b| b.patches.iter())
            .map(MemoryPatch::encoded_len)
            .sum();
        HEADER_SIZE + self.buffers.len() * BUFFER_ENTRY_SIZE + patches
    }

    /// Total number of patches across all buffers.
    #[must_use]
    pub fn patch_count(&self) -> usize {
        self.buffers.iter().map(|b| b.patches.len()).sum()
    }

    /// Encode into the wire record.
    ///
    /// All buffer entries come first, then every patch grouped per buffer in
    /// buffer order.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Bytes {
        let len = self.encoded_len();
        let mut buf = BytesMut::with_capacity(len);

        let flags = u32::from(self.flags.active_list_on) << control::ACTIVE_LIST_SHIFT
            | self.config.mode_bits() << control::MODE_SHIFT
            | u32::from(self.flags.hw_perf_encoding) << control::HW_PERF_SHIFT;
        buf.put_u32_le(flags);
        buf.put_u32_le(self.buffers.len() as u32);

        let mut union = [0u8; CONFIG_UNION_SIZE];
        match self.config {
            SubmitConfig::Xnn {
                layer_base,
                layer_count,
            } => {
                union[0..4].copy_from_slice(&layer_base.to_le_bytes());
                union[4..8].copy_from_slice(&layer_count.to_le_bytes());
            }
            SubmitConfig::Gmm { config_offset } => {
                union[0..4].copy_from_slice(&config_offset.to_le_bytes());
            }
        }
        buf.put_slice(&union);

        for entry in &self.buffers {
            buf.put_u64_le(entry.memory_id.get());
            buf.put_u64_le(entry.offset);
            buf.put_u64_le(entry.size);
            buf.put_u64_le(entry.patches.len() as u64);
        }

        for patch in self.buffers.iter().flat_map(|b| b.patches.iter()) {
            let size = patch.value.size();
            buf.put_u64_le(patch.offset);
            buf.put_u64_le(size as u64);
            patch.value.put(&mut buf);
            buf.put_bytes(0, wire::align(size) - size);
        }

        debug_assert_eq!(buf.len(), len);
        debug_assert_eq!(buf.len() % ALIGNMENT, 0);
        buf.freeze()
    }

    /// Decode a wire record.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidPayload`] if the record is truncated,
    /// misaligned, uses reserved bits or carries an unsupported patch size.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() % ALIGNMENT != 0 {
            return Err(DriverError::invalid_payload(format!(
                "length {} is not {ALIGNMENT}-byte aligned",
                payload.len()
            )));
        }
        if payload.len() < HEADER_SIZE {
            return Err(DriverError::invalid_payload("truncated header"));
        }
        let mut cur = payload;

        let flags = cur.get_u32_le();
        if flags & control::RESERVED_MASK != 0 {
            return Err(DriverError::invalid_payload(format!(
                "reserved control bits set: {flags:#x}"
            )));
        }
        let buffer_count = cur.get_u32_le() as usize;
        let mut union = &cur[..CONFIG_UNION_SIZE];
        cur.advance(CONFIG_UNION_SIZE);

        let config = match (flags >> control::MODE_SHIFT) & control::MODE_MASK {
            control::MODE_XNN => SubmitConfig::Xnn {
                layer_base: union.get_u32_le(),
                layer_count: union.get_u32_le(),
            },
            control::MODE_GMM => SubmitConfig::Gmm {
                config_offset: union.get_u32_le(),
            },
            mode => {
                return Err(DriverError::invalid_payload(format!("unknown mode {mode}")));
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let flags = ControlFlags {
            active_list_on: (flags >> control::ACTIVE_LIST_SHIFT) & 1 == 1,
            hw_perf_encoding: ((flags >> control::HW_PERF_SHIFT) & control::HW_PERF_MASK) as u8,
        };

        if cur.remaining() < buffer_count * BUFFER_ENTRY_SIZE {
            return Err(DriverError::invalid_payload("truncated buffer list"));
        }
        let mut buffers = Vec::with_capacity(buffer_count);
        let mut patch_counts = Vec::with_capacity(buffer_count);
        for _ in 0..buffer_count {
            let memory_id = MemoryId::new(cur.get_u64_le());
            let offset = cur.get_u64_le();
            let size = cur.get_u64_le();
            let count = usize::try_from(cur.get_u64_le())
                .map_err(|_| DriverError::invalid_payload("patch count overflow"))?;
            patch_counts.push(count);
            buffers.push(BufferEntry {
                memory_id,
                offset,
                size,
                patches: Vec::new(),
            });
        }

        for (entry, count) in buffers.iter_mut().zip(patch_counts) {
            for _ in 0..count {
                if cur.remaining() < PATCH_HEADER_SIZE {
                    return Err(DriverError::invalid_payload("truncated patch list"));
                }
                let offset = cur.get_u64_le();
                let size = cur.get_u64_le();
                let padded = usize::try_from(size)
                    .map(wire::align)
                    .map_err(|_| DriverError::invalid_payload("patch size overflow"))?;
                if cur.remaining() < padded {
                    return Err(DriverError::invalid_payload("truncated patch data"));
                }
                let mut data = &cur[..padded];
                let value = match size {
                    1 => PatchValue::U8(data.get_u8()),
                    2 => PatchValue::U16(data.get_u16_le()),
                    4 => PatchValue::U32(data.get_u32_le()),
                    other => {
                        return Err(DriverError::invalid_payload(format!(
                            "unsupported patch size {other}"
                        )));
                    }
                };
                cur.advance(padded);
                entry.patches.push(MemoryPatch::new(offset, value));
            }
        }

        if cur.has_remaining() {
            return Err(DriverError::invalid_payload(format!(
                "{} trailing bytes",
                cur.remaining()
            )));
        }

        Ok(Self {
            flags,
            config,
            buffers,
        })
    }

    /// Apply every patch targeting `memory_id` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidPayload`] if a patch falls outside
    /// `target`.
    pub fn apply_patches(&self, memory_id: MemoryId, target: &mut [u8]) -> Result<()> {
        let patches = self
            .buffers
            .iter()
            .filter(|b| b.memory_id == memory_id)
            .flat_map(|b| b.patches.iter());
        for patch in patches {
            let start = usize::try_from(patch.offset)
                .map_err(|_| DriverError::invalid_payload("patch offset overflow"))?;
            let end = start + patch.value.size();
            let target_len = target.len();
            let dst = target.get_mut(start..end).ok_or_else(|| {
                DriverError::invalid_payload(format!(
                    "patch {start}..{end} outside buffer of {} bytes",
                    target_len
                ))
            })?;
            match patch.value {
                PatchValue::U8(v) => dst[0] = v,
                PatchValue::U16(v) => dst.copy_from_slice(&v.to_le_bytes()),
                PatchValue::U32(v) => dst.copy_from_slice(&v.to_le_bytes()),
            }
        }
        Ok(())
    }
}
