//! Portable scalar kernels
//!
//! Each weighted kernel comes in two flavours selected by `CONSISTENT`:
//! consistent kernels clamp every partial sum to the 32-bit accumulator the
//! device uses, fast kernels accumulate in 64 bits and leave clamping to the
//! final store.

use gna_chip::HwOperation;

use super::{read_signed, read_unsigned, KernelConfig, KernelFn};

/// Fast and consistent kernels of an operation.
pub(crate) fn kernels_for(op: HwOperation) -> (KernelFn, KernelFn) {
    match op {
        HwOperation::Affine => (affine::<false>, affine::<true>),
        HwOperation::AffineDiagonal => (diagonal::<false>, diagonal::<true>),
        HwOperation::Recurrent => (recurrent::<false>, recurrent::<true>),
        HwOperation::Convolution1D => (convolution::<false>, convolution::<true>),
        HwOperation::Copy => (copy, copy),
        HwOperation::Transposition => (transpose, transpose),
        HwOperation::Gmm => (gmm, gmm),
    }
}

#[inline]
fn accumulate<const CONSISTENT: bool>(acc: i64, term: i64, saturations: &mut u32) -> i64 {
    let sum = acc + term;
    if CONSISTENT {
        let clamped = sum.clamp(i64::from(i32::MIN), i64::from(i32::MAX));
        if clamped != sum {
            *saturations += 1;
        }
        clamped
    } else {
        sum
    }
}

/// `out[v][k] = bias[r] + Σ weights[r][i] · input[v][i]` for each output row
/// `r` (active-list row `k`).
pub fn affine<const CONSISTENT: bool>(config: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
    let shape = config.shape;
    let mode = config.mode;
    let rows = config.output_rows();
    let mut saturations = 0;
    for v in 0..shape.vectors {
        for k in 0..rows {
            let row = config.row(k);
            let mut acc = read_signed(config.biases, mode.bias, row);
            for i in 0..shape.inputs {
                let w = read_signed(config.weights, mode.weight, row * shape.inputs + i);
                let x = read_signed(config.input, mode.input, v * shape.inputs + i);
                acc = accumulate::<CONSISTENT>(acc, w * x, &mut saturations);
            }
            out[v * rows + k] = acc;
        }
    }
    saturations
}

/// `out[v][o] = bias[o] + weights[o] · input[v][o]`.
pub fn diagonal<const CONSISTENT: bool>(config: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
    let shape = config.shape;
    let mode = config.mode;
    let mut saturations = 0;
    for v in 0..shape.vectors {
        for o in 0..shape.outputs {
            let bias = read_signed(config.biases, mode.bias, o);
            let w = read_signed(config.weights, mode.weight, o);
            let x = read_signed(config.input, mode.input, v * shape.inputs + o);
            out[v * shape.outputs + o] = accumulate::<CONSISTENT>(bias, w * x, &mut saturations);
        }
    }
    saturations
}

/// One step of a recurrent layer: an affine over the input vector
/// concatenated with the previous output.
pub fn recurrent<const CONSISTENT: bool>(config: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
    let shape = config.shape;
    let mode = config.mode;
    let stride = shape.inputs + shape.outputs;
    let mut saturations = 0;
    for v in 0..shape.vectors {
        for o in 0..shape.outputs {
            let mut acc = read_signed(config.biases, mode.bias, o);
            for i in 0..shape.inputs {
                let w = read_signed(config.weights, mode.weight, o * stride + i);
                let x = read_signed(config.input, mode.input, v * shape.inputs + i);
                acc = accumulate::<CONSISTENT>(acc, w * x, &mut saturations);
            }
            for (j, previous) in config.feedback.iter().enumerate().take(shape.outputs) {
                let w = read_signed(config.weights, mode.weight, o * stride + shape.inputs + j);
                acc = accumulate::<CONSISTENT>(acc, w * previous, &mut saturations);
            }
            out[v * shape.outputs + o] = acc;
        }
    }
    saturations
}

/// `out[p][f] = bias[f] + Σ filters[f][k] · input[p·stride + k]` over a
/// single input vector.
pub fn convolution<const CONSISTENT: bool>(config: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
    let shape = config.shape;
    let mode = config.mode;
    let filters = shape.outputs;
    let mut saturations = 0;
    for p in 0..shape.positions() {
        for f in 0..filters {
            let mut acc = read_signed(config.biases, mode.bias, f);
            for k in 0..shape.filter_size {
                let w = read_signed(config.weights, mode.weight, f * shape.filter_size + k);
                let x = read_signed(config.input, mode.input, p * shape.stride + k);
                acc = accumulate::<CONSISTENT>(acc, w * x, &mut saturations);
            }
            out[p * filters + f] = acc;
        }
    }
    saturations
}

/// Copy the first `outputs` elements of every input vector.
pub fn copy(config: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
    let shape = config.shape;
    for v in 0..shape.vectors {
        for c in 0..shape.outputs {
            out[v * shape.outputs + c] =
                read_signed(config.input, config.mode.input, v * shape.inputs + c);
        }
    }
    0
}

/// `out[c][r] = input[r][c]`.
pub fn transpose(config: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
    let shape = config.shape;
    for r in 0..shape.vectors {
        for c in 0..shape.inputs {
            out[c * shape.vectors + r] =
                read_signed(config.input, config.mode.input, r * shape.inputs + c);
        }
    }
    0
}

/// Gaussian mixture scores: for every state the smallest
/// `constant + Σ (x − mean)² · inverse_covariance` over its mixtures,
/// capped at the maximum score.
pub fn gmm(config: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
    let shape = config.shape;
    let mode = config.mode;
    let rows = config.output_rows();
    let features = shape.inputs;
    let ceiling = i64::from(shape.max_score);
    for v in 0..shape.vectors {
        for k in 0..rows {
            let state = config.row(k);
            let mut best = i64::MAX;
            for m in 0..shape.mixtures {
                let set = state * shape.mixtures + m;
                let mut score = read_unsigned(config.biases, mode.bias, set);
                for f in 0..features {
                    let x = read_unsigned(config.input, mode.input, v * features + f);
                    let mean = read_unsigned(config.weights, mode.input, set * features + f);
                    let ivar = read_unsigned(config.extra, mode.weight, set * features + f);
                    let d = x - mean;
                    score += d * d * ivar;
                }
                best = best.min(score);
            }
            out[v * rows + k] = best.min(ceiling);
        }
    }
    0
}
