//! Layer descriptor layouts.
//!
//! Every hardware layer is described by one fixed-size little-endian record.
//! The field positions depend only on the generation, so the whole layout is
//! a lookup table here; the runtime's descriptor arena writes through it and
//! the request compiler computes patch offsets from it.
//!
//! ## xNN descriptor (128 B)
//!
//! ```text
//! 0x00  u8   opcode
//! 0x01  u8   flags: act-enabled[0] pool[1:2] weight-size[3] (3.x: [3:4])
//! 0x02  u16  input elements        0x04 u16 output elements
//! 0x06  u8   group count           0x07 u8  iteration count
//! 0x08  u16  last-iteration elems  0x0A u8  feedback iterations
//! 0x0C  u16  feedback first elems  0x0E u16 feedback last elems
//! 0x10  u8   pwl segment count     0x12 u16 active-list elements
//! 0x14  u16  copy elements         0x16 u16 conv filter count
//! 0x18  u16  conv filter size      0x1A u8  conv stride
//! 0x1B  u8   3.x precision: input[0:1] bias[2:3]
//! 0x1C  u8   pool window           0x1D u8  pool stride
//! 0x20..0x3F u32 buffers: input, out-activated, out-sum, feedback,
//!            weights, biases, active list, pwl segments
//! 0x40..0x7F GMM block (non-legacy generations)
//! ```
//!
//! On generations with legacy GMM descriptors the GMM block lives in a
//! separate config area appended after all xNN slots.

use std::fmt;

use crate::capability::HardwareCapabilities;
use crate::version::DeviceVersion;

/// Size of one xNN descriptor slot.
pub const XNN_DESCRIPTOR_SIZE: usize = 128;

/// Size of one legacy GMM config record.
pub const GMM_DESCRIPTOR_SIZE: usize = 128;

/// Offset of the GMM block inside an xNN slot on non-legacy generations.
pub const GMM_BLOCK_OFFSET: usize = 0x40;

// ── Field encoding ───────────────────────────────────────────────────────────

/// Storage kind of a descriptor field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Whole byte.
    U8,
    /// Little-endian 16-bit word.
    U16,
    /// Little-endian 32-bit word.
    U32,
    /// Bit range inside a single byte.
    Bits {
        /// Lowest bit position.
        shift: u8,
        /// Number of bits.
        width: u8,
    },
}

impl FieldKind {
    /// Number of bytes touched by a write.
    #[must_use]
    pub const fn byte_len(self) -> usize {
        match self {
            Self::U8 | Self::Bits { .. } => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Largest storable value.
    #[must_use]
    pub const fn max_value(self) -> u32 {
        match self {
            Self::U8 => u8::MAX as u32,
            Self::U16 => u16::MAX as u32,
            Self::U32 => u32::MAX,
            Self::Bits { width, .. } => (1u32 << width as u32) - 1,
        }
    }
}

/// Position and kind of one field, relative to the record it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldLocation {
    /// Byte offset of the containing byte or word.
    pub offset: usize,
    /// Storage kind.
    pub kind: FieldKind,
}

/// A field write that cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldError {
    /// The value does not fit the field.
    Overflow {
        /// Value requested.
        value: u32,
        /// Largest value the field holds.
        max: u32,
    },
    /// The field lies outside the supplied record.
    OutOfBounds {
        /// End of the field.
        end: usize,
        /// Length of the record.
        len: usize,
    },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow { value, max } => {
                write!(f, "value {value} exceeds field maximum {max}")
            }
            Self::OutOfBounds { end, len } => {
                write!(f, "field end {end} beyond record length {len}")
            }
        }
    }
}

impl std::error::Error for FieldError {}

impl FieldLocation {
    /// Create a location.
    #[must_use]
    pub const fn new(offset: usize, kind: FieldKind) -> Self {
        Self { offset, kind }
    }

    /// Same field, shifted by `base` bytes.
    #[must_use]
    pub const fn rebased(self, base: usize) -> Self {
        Self {
            offset: self.offset + base,
            kind: self.kind,
        }
    }

    /// Whether `value` fits.
    #[must_use]
    pub const fn fits(self, value: u32) -> bool {
        value <= self.kind.max_value()
    }

    /// Write `value` into `record`.
    ///
    /// Bit fields are read-modify-written against their containing byte
    /// only, so sibling bits in that byte are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if the value does not fit or the field lies
    /// outside `record`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(self, record: &mut [u8], value: u32) -> Result<(), FieldError> {
        let max = self.kind.max_value();
        if value > max {
            return Err(FieldError::Overflow { value, max });
        }
        let end = self.offset + self.kind.byte_len();
        let len = record.len();
        let bytes = record
            .get_mut(self.offset..end)
            .ok_or(FieldError::OutOfBounds { end, len })?;
        match self.kind {
            FieldKind::U8 => bytes[0] = value as u8,
            FieldKind::U16 => bytes.copy_from_slice(&(value as u16).to_le_bytes()),
            FieldKind::U32 => bytes.copy_from_slice(&value.to_le_bytes()),
            FieldKind::Bits { shift, .. } => {
                let mask = (max as u8) << shift;
                bytes[0] = (bytes[0] & !mask) | (((value as u8) << shift) & mask);
            }
        }
        Ok(())
    }

    /// Read the field from `record`.
    #[must_use]
    pub fn read(self, record: &[u8]) -> Option<u32> {
        let bytes = record.get(self.offset..self.offset + self.kind.byte_len())?;
        Some(match self.kind {
            FieldKind::U8 => u32::from(bytes[0]),
            FieldKind::U16 => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            FieldKind::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            FieldKind::Bits { shift, .. } => {
                (u32::from(bytes[0]) >> shift) & self.kind.max_value()
            }
        })
    }
}

// ── Fields ───────────────────────────────────────────────────────────────────

/// Fields of an xNN descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum XnnField {
    OpCode,
    ActivationEnabled,
    PoolParam,
    WeightSize,
    InputElementCount,
    OutputElementCount,
    GroupCount,
    IterationCount,
    LastIterationElementCount,
    FeedbackIterationCount,
    FeedbackFirstElementCount,
    FeedbackLastElementCount,
    PwlSegmentCount,
    ActiveListElementCount,
    CopyElementCount,
    ConvFilterCount,
    ConvFilterSize,
    ConvStride,
    PoolSize,
    PoolStride,
    InputPrecision,
    BiasPrecision,
    InputBuffer,
    OutputActivatedBuffer,
    OutputSumBuffer,
    FeedbackBuffer,
    WeightBuffer,
    BiasBuffer,
    ActiveListBuffer,
    PwlSegmentBuffer,
}

/// Fields of a GMM block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum GmmField {
    FeatureVectorAddress,
    FeatureVectorStride,
    FeatureVectorLength,
    InverseCovarianceWidth,
    ScoreLength,
    ScoreAddress,
    MeanAddress,
    MeanSetStride,
    InverseCovarianceAddress,
    InverseCovarianceSetStride,
    ConstantAddress,
    ConstantSetStride,
    ActiveListAddress,
    ActiveListLength,
    MixtureCount,
    VectorCount,
    MaximumScore,
}

/// Where a generation keeps GMM blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmmPlacement {
    /// Separate config area after the xNN slots, one record per GMM layer.
    ConfigArea,
    /// Inside the layer's own xNN slot.
    InSlot {
        /// Offset of the block within the slot.
        offset: usize,
    },
}

/// Descriptor layout of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorLayout {
    /// Generation described.
    pub version: DeviceVersion,
    /// Size of one xNN slot.
    pub xnn_size: usize,
    /// Size of one legacy GMM config record.
    pub gmm_config_size: usize,
    /// GMM block placement.
    pub gmm_placement: GmmPlacement,
}

impl DescriptorLayout {
    /// Layout of a generation.
    #[must_use]
    pub const fn for_version(version: DeviceVersion) -> Self {
        let gmm_placement = if HardwareCapabilities::for_version(version).has_legacy_gmm_descriptor
        {
            GmmPlacement::ConfigArea
        } else {
            GmmPlacement::InSlot {
                offset: GMM_BLOCK_OFFSET,
            }
        };
        Self {
            version,
            xnn_size: XNN_DESCRIPTOR_SIZE,
            gmm_config_size: GMM_DESCRIPTOR_SIZE,
            gmm_placement,
        }
    }

    /// Whether GMM layers use the separate config area.
    #[must_use]
    pub const fn has_gmm_config_area(&self) -> bool {
        matches!(self.gmm_placement, GmmPlacement::ConfigArea)
    }

    /// Total descriptor area for a model with `layer_count` layers of which
    /// `gmm_count` are GMM layers.
    #[must_use]
    pub const fn area_size(&self, layer_count: usize, gmm_count: usize) -> usize {
        let xnn = self.xnn_size * layer_count;
        if self.has_gmm_config_area() {
            xnn + self.gmm_config_size * gmm_count
        } else {
            xnn
        }
    }

    /// Location of an xNN field within a slot, `None` if the generation
    /// lacks it.
    #[must_use]
    pub const fn xnn(&self, field: XnnField) -> Option<FieldLocation> {
        use FieldKind::{Bits, U16, U32, U8};
        let extended = self.version.has_precision_flags();
        let loc = match field {
            XnnField::OpCode => FieldLocation::new(0x00, U8),
            XnnField::ActivationEnabled => FieldLocation::new(0x01, Bits { shift: 0, width: 1 }),
            XnnField::PoolParam => FieldLocation::new(0x01, Bits { shift: 1, width: 2 }),
            XnnField::WeightSize => {
                let width = if extended { 2 } else { 1 };
                FieldLocation::new(0x01, Bits { shift: 3, width })
            }
            XnnField::InputElementCount => FieldLocation::new(0x02, U16),
            XnnField::OutputElementCount => FieldLocation::new(0x04, U16),
            XnnField::GroupCount => FieldLocation::new(0x06, U8),
            XnnField::IterationCount => FieldLocation::new(0x07, U8),
            XnnField::LastIterationElementCount => FieldLocation::new(0x08, U16),
            XnnField::FeedbackIterationCount => FieldLocation::new(0x0A, U8),
            XnnField::FeedbackFirstElementCount => FieldLocation::new(0x0C, U16),
            XnnField::FeedbackLastElementCount => FieldLocation::new(0x0E, U16),
            XnnField::PwlSegmentCount => FieldLocation::new(0x10, U8),
            XnnField::ActiveListElementCount => FieldLocation::new(0x12, U16),
            XnnField::CopyElementCount => FieldLocation::new(0x14, U16),
            XnnField::ConvFilterCount => FieldLocation::new(0x16, U16),
            XnnField::ConvFilterSize => FieldLocation::new(0x18, U16),
            XnnField::ConvStride => FieldLocation::new(0x1A, U8),
            XnnField::InputPrecision | XnnField::BiasPrecision if !extended => return None,
            XnnField::InputPrecision => FieldLocation::new(0x1B, Bits { shift: 0, width: 2 }),
            XnnField::BiasPrecision => FieldLocation::new(0x1B, Bits { shift: 2, width: 2 }),
            XnnField::PoolSize => FieldLocation::new(0x1C, U8),
            XnnField::PoolStride => FieldLocation::new(0x1D, U8),
            XnnField::InputBuffer => FieldLocation::new(0x20, U32),
            XnnField::OutputActivatedBuffer => FieldLocation::new(0x24, U32),
            XnnField::OutputSumBuffer => FieldLocation::new(0x28, U32),
            XnnField::FeedbackBuffer => FieldLocation::new(0x2C, U32),
            XnnField::WeightBuffer => FieldLocation::new(0x30, U32),
            XnnField::BiasBuffer => FieldLocation::new(0x34, U32),
            XnnField::ActiveListBuffer => FieldLocation::new(0x38, U32),
            XnnField::PwlSegmentBuffer => FieldLocation::new(0x3C, U32),
        };
        Some(loc)
    }

    /// Location of a GMM field relative to the start of the GMM block.
    #[must_use]
    pub const fn gmm(&self, field: GmmField) -> FieldLocation {
        use FieldKind::{Bits, U16, U32, U8};
        match field {
            GmmField::FeatureVectorAddress => FieldLocation::new(0x00, U32),
            GmmField::FeatureVectorStride => FieldLocation::new(0x04, U32),
            GmmField::FeatureVectorLength => FieldLocation::new(0x08, U32),
            GmmField::InverseCovarianceWidth => {
                FieldLocation::new(0x0C, Bits { shift: 0, width: 1 })
            }
            GmmField::ScoreLength => FieldLocation::new(0x10, U32),
            GmmField::ScoreAddress => FieldLocation::new(0x14, U32),
            GmmField::MeanAddress => FieldLocation::new(0x18, U32),
            GmmField::MeanSetStride => FieldLocation::new(0x1C, U32),
            GmmField::InverseCovarianceAddress => FieldLocation::new(0x20, U32),
            GmmField::InverseCovarianceSetStride => FieldLocation::new(0x24, U32),
            GmmField::ConstantAddress => FieldLocation::new(0x28, U32),
            GmmField::ConstantSetStride => FieldLocation::new(0x2C, U32),
            GmmField::ActiveListAddress => FieldLocation::new(0x30, U32),
            GmmField::ActiveListLength => FieldLocation::new(0x34, U32),
            GmmField::MixtureCount => FieldLocation::new(0x38, U16),
            GmmField::VectorCount => FieldLocation::new(0x3A, U8),
            GmmField::MaximumScore => FieldLocation::new(0x3C, U32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_fields_preserve_siblings() {
        let layout = DescriptorLayout::for_version(DeviceVersion::Gna2_0);
        let mut slot = [0u8; XNN_DESCRIPTOR_SIZE];
        let act = layout.xnn(XnnField::ActivationEnabled).unwrap();
        let pool = layout.xnn(XnnField::PoolParam).unwrap();
        let weight = layout.xnn(XnnField::WeightSize).unwrap();

        act.write(&mut slot, 1).unwrap();
        pool.write(&mut slot, 2).unwrap();
        weight.write(&mut slot, 1).unwrap();
        pool.write(&mut slot, 1).unwrap();

        assert_eq!(act.read(&slot), Some(1));
        assert_eq!(pool.read(&slot), Some(1));
        assert_eq!(weight.read(&slot), Some(1));
        assert_eq!(slot[1], 0b0000_1011);
    }

    #[test]
    fn overflow_is_rejected() {
        let layout = DescriptorLayout::for_version(DeviceVersion::Gna1_0);
        let mut slot = [0u8; XNN_DESCRIPTOR_SIZE];
        let iterations = layout.xnn(XnnField::IterationCount).unwrap();
        assert_eq!(
            iterations.write(&mut slot, 256),
            Err(FieldError::Overflow {
                value: 256,
                max: 255
            })
        );
    }

    #[test]
    fn precision_byte_only_on_3x() {
        let v2 = DescriptorLayout::for_version(DeviceVersion::Gna2_0);
        let v3 = DescriptorLayout::for_version(DeviceVersion::Gna3_0);
        assert!(v2.xnn(XnnField::InputPrecision).is_none());
        assert_eq!(
            v3.xnn(XnnField::BiasPrecision),
            Some(FieldLocation::new(0x1B, FieldKind::Bits { shift: 2, width: 2 }))
        );
        assert_eq!(
            v3.xnn(XnnField::WeightSize).unwrap().kind,
            FieldKind::Bits { shift: 3, width: 2 }
        );
    }

    #[test]
    fn gmm_area_only_on_legacy() {
        let legacy = DescriptorLayout::for_version(DeviceVersion::Gna1_0);
        let modern = DescriptorLayout::for_version(DeviceVersion::Gna2_0);
        assert_eq!(legacy.area_size(3, 2), 3 * 128 + 2 * 128);
        assert_eq!(modern.area_size(3, 2), 3 * 128);
        assert_eq!(
            modern.gmm_placement,
            GmmPlacement::InSlot {
                offset: GMM_BLOCK_OFFSET
            }
        );
    }

    #[test]
    fn gmm_block_fits_slot() {
        let layout = DescriptorLayout::for_version(DeviceVersion::Gna3_0);
        let last = layout.gmm(GmmField::MaximumScore);
        assert_eq!(
            GMM_BLOCK_OFFSET + last.offset + last.kind.byte_len(),
            XNN_DESCRIPTOR_SIZE
        );
    }

    #[test]
    fn wide_fields_are_little_endian() {
        let layout = DescriptorLayout::for_version(DeviceVersion::Gna2_0);
        let mut slot = [0u8; XNN_DESCRIPTOR_SIZE];
        let input = layout.xnn(XnnField::InputBuffer).unwrap();
        input.write(&mut slot, 0x1234_5678).unwrap();
        assert_eq!(&slot[0x20..0x24], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(input.read(&slot), Some(0x1234_5678));
        assert!(input.read(&slot[..0x22]).is_none());
    }
}
