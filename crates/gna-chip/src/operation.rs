//! Hardware operations, operand data widths and descriptor opcodes.

use std::fmt;

/// Scoring operation as the accelerator understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HwOperation {
    /// Fully connected layer.
    Affine,
    /// Affine layer with a diagonal weight matrix.
    AffineDiagonal,
    /// Affine layer fed back its own previous output.
    Recurrent,
    /// One-dimensional convolution with optional pooling.
    Convolution1D,
    /// Row copy between buffers.
    Copy,
    /// Interleave / de-interleave transposition.
    Transposition,
    /// Gaussian mixture scoring.
    Gmm,
}

impl HwOperation {
    /// Every operation, in table order.
    pub const ALL: [Self; 7] = [
        Self::Affine,
        Self::AffineDiagonal,
        Self::Recurrent,
        Self::Convolution1D,
        Self::Copy,
        Self::Transposition,
        Self::Gmm,
    ];

    /// Whether the operation has a weight operand.
    #[must_use]
    pub const fn has_weights(self) -> bool {
        !matches!(self, Self::Copy | Self::Transposition)
    }

    /// Whether the operation may carry a piecewise-linear activation.
    #[must_use]
    pub const fn has_activation(self) -> bool {
        matches!(
            self,
            Self::Affine | Self::AffineDiagonal | Self::Recurrent | Self::Convolution1D
        )
    }

    /// Whether an active list may be attached to a layer of this kind.
    #[must_use]
    pub const fn accepts_active_list(self) -> bool {
        matches!(self, Self::Affine | Self::Gmm)
    }
}

impl fmt::Display for HwOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Affine => "affine",
            Self::AffineDiagonal => "affine-diagonal",
            Self::Recurrent => "recurrent",
            Self::Convolution1D => "convolution-1d",
            Self::Copy => "copy",
            Self::Transposition => "transposition",
            Self::Gmm => "gmm",
        };
        f.write_str(name)
    }
}

/// Element width of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataWidth {
    /// Operand absent.
    Disabled,
    /// Signed 8-bit (unsigned for GMM feature vectors and means).
    Int8,
    /// Signed 16-bit.
    Int16,
    /// Signed 32-bit.
    Int32,
    /// 8-byte piecewise-linear segment record.
    PwlSegment,
}

impl DataWidth {
    /// Element size in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 => 4,
            Self::PwlSegment => 8,
        }
    }

    /// Weight-size code (`0` = 16-bit, `1` = 8-bit).
    #[must_use]
    pub const fn weight_size_code(self) -> u32 {
        match self {
            Self::Int8 => 1,
            _ => 0,
        }
    }

    /// Two-bit precision code used by the 3.x precision byte.
    #[must_use]
    pub const fn precision_code(self) -> u32 {
        match self {
            Self::Int8 => 0,
            Self::Int16 => 1,
            Self::Int32 => 2,
            Self::Disabled | Self::PwlSegment => 3,
        }
    }
}

impl fmt::Display for DataWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::PwlSegment => f.write_str("pwl"),
            width => write!(f, "i{}", width.bytes() * 8),
        }
    }
}

/// Data-width triple of a layer: input, weight and bias widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataMode {
    /// Input element width.
    pub input: DataWidth,
    /// Weight element width (means/inverse covariances for GMM).
    pub weight: DataWidth,
    /// Bias element width (GMM constants).
    pub bias: DataWidth,
}

impl DataMode {
    /// Create a data mode.
    #[must_use]
    pub const fn new(input: DataWidth, weight: DataWidth, bias: DataWidth) -> Self {
        Self {
            input,
            weight,
            bias,
        }
    }

    /// Input-only mode used by copy and transposition.
    #[must_use]
    pub const fn input_only(input: DataWidth) -> Self {
        Self::new(input, DataWidth::Disabled, DataWidth::Disabled)
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.input, self.weight, self.bias)
    }
}

/// Opcode byte stored at offset 0 of every xNN descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NnOpCode {
    /// Affine.
    Affine = 0x00,
    /// Diagonal affine.
    AffineDiagonal = 0x01,
    /// Recurrent.
    Recurrent = 0x02,
    /// 1-D convolution.
    Convolution1D = 0x03,
    /// Affine restricted to an active list.
    AffineActiveList = 0x04,
    /// De-interleave transposition.
    Deinterleave = 0x05,
    /// Interleave transposition.
    Interleave = 0x06,
    /// Copy.
    Copy = 0x07,
    /// GMM embedded in the xNN stream.
    Gmm = 0x08,
    /// GMM restricted to an active list.
    GmmActiveList = 0x09,
}

impl NnOpCode {
    /// Opcode for an operation.
    ///
    /// Transpositions pick the direction from the input shape: fewer rows
    /// than columns interleaves, otherwise the layer de-interleaves.
    #[must_use]
    pub const fn for_operation(op: HwOperation, rows: usize, columns: usize) -> Self {
        match op {
            HwOperation::Affine => Self::Affine,
            HwOperation::AffineDiagonal => Self::AffineDiagonal,
            HwOperation::Recurrent => Self::Recurrent,
            HwOperation::Convolution1D => Self::Convolution1D,
            HwOperation::Copy => Self::Copy,
            HwOperation::Gmm => Self::Gmm,
            HwOperation::Transposition => {
                if rows < columns {
                    Self::Interleave
                } else {
                    Self::Deinterleave
                }
            }
        }
    }

    /// The opcode a layer switches to when an active list is attached.
    #[must_use]
    pub const fn with_active_list(self) -> Option<Self> {
        match self {
            Self::Affine => Some(Self::AffineActiveList),
            Self::Gmm => Some(Self::GmmActiveList),
            _ => None,
        }
    }

    /// Decode an opcode byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Affine,
            0x01 => Self::AffineDiagonal,
            0x02 => Self::Recurrent,
            0x03 => Self::Convolution1D,
            0x04 => Self::AffineActiveList,
            0x05 => Self::Deinterleave,
            0x06 => Self::Interleave,
            0x07 => Self::Copy,
            0x08 => Self::Gmm,
            0x09 => Self::GmmActiveList,
            _ => return None,
        })
    }

    /// Raw opcode byte.
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths() {
        assert_eq!(DataWidth::Int16.bytes(), 2);
        assert_eq!(DataWidth::PwlSegment.bytes(), 8);
        assert_eq!(DataWidth::Int8.to_string(), "i8");
        assert_eq!(
            DataMode::new(DataWidth::Int16, DataWidth::Int8, DataWidth::Int32).to_string(),
            "i16/i8/i32"
        );
    }

    #[test]
    fn active_list_opcodes() {
        assert_eq!(
            NnOpCode::Affine.with_active_list(),
            Some(NnOpCode::AffineActiveList)
        );
        assert_eq!(NnOpCode::Gmm.with_active_list(), Some(NnOpCode::GmmActiveList));
        assert_eq!(NnOpCode::Recurrent.with_active_list(), None);
    }

    #[test]
    fn transposition_direction() {
        assert_eq!(
            NnOpCode::for_operation(HwOperation::Transposition, 2, 8),
            NnOpCode::Interleave
        );
        assert_eq!(
            NnOpCode::for_operation(HwOperation::Transposition, 8, 2),
            NnOpCode::Deinterleave
        );
    }

    #[test]
    fn opcode_bytes_decode() {
        for byte in 0x00..=0x09 {
            let code = NnOpCode::from_byte(byte).unwrap();
            assert_eq!(code.byte(), byte);
        }
        assert_eq!(NnOpCode::from_byte(0x0A), None);
    }
}
