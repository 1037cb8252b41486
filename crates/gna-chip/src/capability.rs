//! Per-generation hardware capability tables.
//!
//! For each [`DeviceVersion`] this answers three questions the partitioner
//! asks: can the chip run this operation with these operand widths, how many
//! layers fit in one hardware run, and does GMM scoring go through the
//! legacy GMM descriptor.

use crate::operation::{DataMode, DataWidth, HwOperation};
use crate::version::DeviceVersion;

/// How a generation supports one (operation, data mode) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Support {
    /// Must run in software.
    Unsupported,
    /// Runs inside an xNN descriptor run.
    Native,
    /// Runs only through the legacy GMM descriptor (always a singleton run).
    LegacyGmm,
}

impl Support {
    /// Whether the chip can execute the pair at all.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

/// Static capability record of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareCapabilities {
    /// Generation described.
    pub version: DeviceVersion,
    /// Maximum number of layers in one hardware run.
    pub max_layer_count: usize,
    /// Default on-chip input buffer size in KiB.
    pub input_buffer_kb: u32,
    /// GMM layers are described by a separate config record.
    pub has_legacy_gmm_descriptor: bool,
}

impl HardwareCapabilities {
    /// Capability record for a generation.
    #[must_use]
    pub const fn for_version(version: DeviceVersion) -> Self {
        let (max_layer_count, input_buffer_kb, has_legacy_gmm_descriptor) = match version {
            DeviceVersion::Gmm => (1, 12, true),
            DeviceVersion::Gna1_0 => (1023, 12, true),
            DeviceVersion::Embedded1_0 => (1024, 12, false),
            DeviceVersion::Gna2_0 => (4096, 12, false),
            DeviceVersion::Gna3_0
            | DeviceVersion::Gna3_5
            | DeviceVersion::Embedded3_0
            | DeviceVersion::Embedded3_1 => (8192, 24, false),
        };
        Self {
            version,
            max_layer_count,
            input_buffer_kb,
            has_legacy_gmm_descriptor,
        }
    }

    /// Input buffer size in bytes.
    #[must_use]
    pub const fn input_buffer_bytes(&self) -> usize {
        self.input_buffer_kb as usize * 1024
    }

    /// Support level for an operation with the given operand widths.
    #[must_use]
    pub fn support(&self, op: HwOperation, mode: DataMode) -> Support {
        if op == HwOperation::Gmm {
            return self.gmm_support(mode);
        }
        if self.version == DeviceVersion::Gmm {
            return Support::Unsupported;
        }
        if self.nn_mode_supported(op, mode) {
            Support::Native
        } else {
            Support::Unsupported
        }
    }

    fn gmm_support(&self, mode: DataMode) -> Support {
        let widths_ok = mode.input == DataWidth::Int8
            && matches!(mode.weight, DataWidth::Int8 | DataWidth::Int16)
            && mode.bias == DataWidth::Int32;
        if !widths_ok {
            return Support::Unsupported;
        }
        match self.version {
            DeviceVersion::Embedded1_0 => Support::Unsupported,
            _ if self.has_legacy_gmm_descriptor => Support::LegacyGmm,
            _ => Support::Native,
        }
    }

    fn nn_mode_supported(&self, op: HwOperation, mode: DataMode) -> bool {
        let extended = self.version.has_precision_flags();
        let input_ok = match mode.input {
            DataWidth::Int16 => true,
            DataWidth::Int8 => extended,
            _ => false,
        };
        if !input_ok {
            return false;
        }
        if !op.has_weights() {
            return mode.weight == DataWidth::Disabled && mode.bias == DataWidth::Disabled;
        }
        let weight_ok = matches!(mode.weight, DataWidth::Int8 | DataWidth::Int16);
        let bias_ok = match mode.bias {
            DataWidth::Int32 => true,
            DataWidth::Int8 | DataWidth::Int16 | DataWidth::Disabled => extended,
            DataWidth::PwlSegment => false,
        };
        weight_ok && bias_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const I16_I16_I32: DataMode =
        DataMode::new(DataWidth::Int16, DataWidth::Int16, DataWidth::Int32);
    const I8_I8_I8: DataMode = DataMode::new(DataWidth::Int8, DataWidth::Int8, DataWidth::Int8);
    const GMM_MODE: DataMode = DataMode::new(DataWidth::Int8, DataWidth::Int16, DataWidth::Int32);

    #[test]
    fn gmm_only_device() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Gmm);
        assert_eq!(caps.support(HwOperation::Gmm, GMM_MODE), Support::LegacyGmm);
        assert_eq!(
            caps.support(HwOperation::Affine, I16_I16_I32),
            Support::Unsupported
        );
        assert_eq!(caps.max_layer_count, 1);
    }

    #[test]
    fn gna1_uses_legacy_gmm() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Gna1_0);
        assert_eq!(caps.support(HwOperation::Gmm, GMM_MODE), Support::LegacyGmm);
        assert_eq!(caps.support(HwOperation::Affine, I16_I16_I32), Support::Native);
        assert_eq!(caps.support(HwOperation::Affine, I8_I8_I8), Support::Unsupported);
    }

    #[test]
    fn gna3_accepts_narrow_operands() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Gna3_0);
        assert_eq!(caps.support(HwOperation::Affine, I8_I8_I8), Support::Native);
        assert_eq!(caps.support(HwOperation::Gmm, GMM_MODE), Support::Native);
        assert!(!caps.has_legacy_gmm_descriptor);
    }

    #[test]
    fn copy_rejects_weights() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Gna2_0);
        let copy = DataMode::input_only(DataWidth::Int16);
        assert_eq!(caps.support(HwOperation::Copy, copy), Support::Native);
        assert_eq!(
            caps.support(HwOperation::Copy, I16_I16_I32),
            Support::Unsupported
        );
    }

    #[test]
    fn embedded_1_has_no_gmm() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Embedded1_0);
        assert_eq!(caps.support(HwOperation::Gmm, GMM_MODE), Support::Unsupported);
    }
}
