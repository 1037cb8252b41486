//! Software scoring kernels
//!
//! Every `(operation, data mode)` pair the runtime accepts has a
//! [`KernelMap`] holding one function per [`KernelMode`] and arithmetic
//! flavour. Modes the host lacks point at the generic kernels, so a lookup
//! never fails for a pair the table knows. Kernels write raw accumulators;
//! the executor applies pooling, activation and output saturation.

pub mod generic;
pub mod pwl;

use std::collections::HashMap;

use gna_chip::{DataMode, DataWidth, HwOperation};

use crate::cpu::{KernelMode, SoftwareModes};

/// Operation a kernel implements.
pub type KernelOp = HwOperation;

/// Kernel entry point. Fills `out` and returns how many accumulations
/// saturated.
pub type KernelFn = fn(&KernelConfig<'_>, &mut [i64]) -> u32;

/// Dimensions of one kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelShape {
    /// Input vectors (rows of the input tensor)
    pub vectors: usize,
    /// Elements per input vector
    pub inputs: usize,
    /// Outputs per vector (filters for convolution, states for GMM)
    pub outputs: usize,
    /// Convolution filter length
    pub filter_size: usize,
    /// Convolution stride
    pub stride: usize,
    /// GMM mixtures per state
    pub mixtures: usize,
    /// GMM score ceiling
    pub max_score: u32,
}

impl KernelShape {
    /// Convolution output positions.
    #[must_use]
    pub const fn positions(&self) -> usize {
        if self.inputs < self.filter_size || self.stride == 0 {
            0
        } else {
            (self.inputs - self.filter_size) / self.stride + 1
        }
    }
}

/// Operands of one kernel invocation, as raw little-endian bytes.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig<'a> {
    /// Dimensions
    pub shape: KernelShape,
    /// Operand widths
    pub mode: DataMode,
    /// Input tensor
    pub input: &'a [u8],
    /// Weights (GMM means)
    pub weights: &'a [u8],
    /// Biases (GMM constants)
    pub biases: &'a [u8],
    /// GMM inverse covariances
    pub extra: &'a [u8],
    /// Previous output of a recurrent layer
    pub feedback: &'a [i64],
    /// Output rows to compute, in output order
    pub active: Option<&'a [u32]>,
}

impl KernelConfig<'_> {
    /// Outputs produced per vector.
    #[must_use]
    pub fn output_rows(&self) -> usize {
        self.active.map_or(self.shape.outputs, <[u32]>::len)
    }

    /// Source row of output `k`.
    #[must_use]
    pub fn row(&self, k: usize) -> usize {
        self.active.map_or(k, |list| list[k] as usize)
    }
}

// ── Element access ───────────────────────────────────────────────────────────

/// Signed element `index` of a tensor. Disabled operands read as zero.
#[must_use]
pub fn read_signed(bytes: &[u8], width: DataWidth, index: usize) -> i64 {
    match width {
        DataWidth::Int8 => i64::from(i8::from_le_bytes([bytes[index]])),
        DataWidth::Int16 => {
            let at = index * 2;
            i64::from(i16::from_le_bytes([bytes[at], bytes[at + 1]]))
        }
        DataWidth::Int32 => {
            let at = index * 4;
            i64::from(i32::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
            ]))
        }
        DataWidth::Disabled | DataWidth::PwlSegment => 0,
    }
}

/// Unsigned element `index` of a tensor.
#[must_use]
pub fn read_unsigned(bytes: &[u8], width: DataWidth, index: usize) -> i64 {
    match width {
        DataWidth::Int8 => i64::from(bytes[index]),
        DataWidth::Int16 => {
            let at = index * 2;
            i64::from(u16::from_le_bytes([bytes[at], bytes[at + 1]]))
        }
        DataWidth::Int32 => {
            let at = index * 4;
            i64::from(u32::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
            ]))
        }
        DataWidth::Disabled | DataWidth::PwlSegment => 0,
    }
}

/// Store `value` as element `index`, clamped to the width's signed range.
/// Returns whether the value had to be clamped.
#[allow(clippy::cast_possible_truncation)]
pub fn write_saturated(bytes: &mut [u8], width: DataWidth, index: usize, value: i64) -> bool {
    let (min, max) = match width {
        DataWidth::Int8 => (i64::from(i8::MIN), i64::from(i8::MAX)),
        DataWidth::Int16 => (i64::from(i16::MIN), i64::from(i16::MAX)),
        DataWidth::Int32 => (i64::from(i32::MIN), i64::from(i32::MAX)),
        DataWidth::Disabled | DataWidth::PwlSegment => return false,
    };
    let clamped = value.clamp(min, max);
    match width {
        DataWidth::Int8 => bytes[index] = (clamped as i8).to_le_bytes()[0],
        DataWidth::Int16 => {
            bytes[index * 2..index * 2 + 2].copy_from_slice(&(clamped as i16).to_le_bytes());
        }
        _ => bytes[index * 4..index * 4 + 4].copy_from_slice(&(clamped as i32).to_le_bytes()),
    }
    clamped != value
}

// ── Kernel table ─────────────────────────────────────────────────────────────

/// Data modes the software kernels accept for an operation.
#[must_use]
pub fn data_modes(op: KernelOp) -> Vec<DataMode> {
    use DataWidth::{Disabled, Int16, Int32, Int8};
    match op {
        HwOperation::Copy | HwOperation::Transposition => vec![
            DataMode::new(Int8, Disabled, Disabled),
            DataMode::new(Int16, Disabled, Disabled),
        ],
        HwOperation::Gmm => vec![
            DataMode::new(Int8, Int8, Int32),
            DataMode::new(Int8, Int16, Int32),
        ],
        _ => {
            let mut modes = Vec::new();
            for input in [Int8, Int16] {
                for weight in [Int8, Int16] {
                    for bias in [Disabled, Int8, Int16, Int32] {
                        modes.push(DataMode::new(input, weight, bias));
                    }
                }
            }
            modes
        }
    }
}

/// Kernels of one `(operation, data mode)` pair, indexed by kernel mode and
/// arithmetic flavour.
#[derive(Clone, Copy)]
pub struct KernelMap {
    kernels: [[KernelFn; 2]; 4],
}

impl KernelMap {
    fn uniform(fast: KernelFn, consistent: KernelFn) -> Self {
        Self {
            kernels: [[fast, consistent]; 4],
        }
    }

    /// Kernel for a mode and flavour.
    #[must_use]
    pub fn get(&self, mode: KernelMode, consistent: bool) -> KernelFn {
        self.kernels[mode.index()][usize::from(consistent)]
    }
}

impl std::fmt::Debug for KernelMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelMap").finish_non_exhaustive()
    }
}

/// Kernel lookup for every accepted `(operation, data mode)` pair.
#[derive(Debug)]
pub struct KernelTable {
    modes: SoftwareModes,
    maps: HashMap<(KernelOp, DataMode), KernelMap>,
}

impl KernelTable {
    /// Table of generic kernels, aliased into every mode.
    #[must_use]
    pub fn new(modes: SoftwareModes) -> Self {
        let mut maps = HashMap::new();
        for op in HwOperation::ALL {
            let (fast, consistent) = generic::kernels_for(op);
            for mode in data_modes(op) {
                maps.insert((op, mode), KernelMap::uniform(fast, consistent));
            }
        }
        tracing::debug!("Kernel table: {} operation/data-mode pairs", maps.len());
        Self { modes, maps }
    }

    /// Host modes the table was built for.
    #[must_use]
    pub const fn modes(&self) -> &SoftwareModes {
        &self.modes
    }

    /// Whether the pair has kernels.
    #[must_use]
    pub fn contains(&self, op: KernelOp, mode: DataMode) -> bool {
        self.maps.contains_key(&(op, mode))
    }

    /// Plug in an accelerated kernel. Ignored, returning `false`, when the
    /// host lacks `kernel_mode` or the pair is unknown.
    pub fn register_accelerated(
        &mut self,
        op: KernelOp,
        mode: DataMode,
        kernel_mode: KernelMode,
        consistent: bool,
        kernel: KernelFn,
    ) -> bool {
        if !self.modes.is_supported(kernel_mode) {
            tracing::debug!("Skipping {kernel_mode} kernel for {op} {mode}: not supported");
            return false;
        }
        match self.maps.get_mut(&(op, mode)) {
            Some(map) => {
                map.kernels[kernel_mode.index()][usize::from(consistent)] = kernel;
                true
            }
            None => false,
        }
    }

    /// Kernel map of a pair.
    ///
    /// # Panics
    ///
    /// Panics if the pair is not in the table. Layers are validated against
    /// [`KernelTable::contains`] when a model is compiled, so reaching this
    /// is a bug.
    #[must_use]
    pub fn map(&self, op: KernelOp, mode: DataMode) -> &KernelMap {
        self.maps
            .get(&(op, mode))
            .unwrap_or_else(|| panic!("no kernels for {op} {mode}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_kernel(_: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
        out.fill(0);
        0
    }

    #[test]
    fn every_mode_resolves() {
        let table = KernelTable::new(SoftwareModes::generic_only());
        for op in HwOperation::ALL {
            for mode in data_modes(op) {
                let map = table.map(op, mode);
                for kernel_mode in KernelMode::ALL {
                    let _ = map.get(kernel_mode, true);
                    let _ = map.get(kernel_mode, false);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "no kernels")]
    fn unknown_pair_panics() {
        let table = KernelTable::new(SoftwareModes::generic_only());
        let _ = table.map(
            HwOperation::Copy,
            DataMode::new(DataWidth::Int32, DataWidth::Int32, DataWidth::Int32),
        );
    }

    #[test]
    fn accelerated_kernels_need_host_support() {
        let mut table = KernelTable::new(SoftwareModes::generic_only());
        let mode = DataMode::new(DataWidth::Int16, DataWidth::Int16, DataWidth::Int32);
        assert!(!table.register_accelerated(
            HwOperation::Affine,
            mode,
            KernelMode::Avx2,
            true,
            zero_kernel
        ));
        assert!(table.register_accelerated(
            HwOperation::Affine,
            mode,
            KernelMode::Generic,
            true,
            zero_kernel
        ));
        assert_eq!(
            table.map(HwOperation::Affine, mode).get(KernelMode::Generic, true) as usize,
            zero_kernel as KernelFn as usize
        );
    }

    #[test]
    fn saturating_store() {
        let mut bytes = [0u8; 4];
        assert!(write_saturated(&mut bytes, DataWidth::Int16, 1, 40_000));
        assert_eq!(read_signed(&bytes, DataWidth::Int16, 1), i64::from(i16::MAX));
        assert!(!write_saturated(&mut bytes, DataWidth::Int8, 0, -5));
        assert_eq!(read_signed(&bytes, DataWidth::Int8, 0), -5);
        assert_eq!(read_unsigned(&bytes, DataWidth::Int8, 0), 251);
    }
}
