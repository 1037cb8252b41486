//! Software execution of layer runs
//!
//! Layers are scored one after another on the calling worker. Kernels fill
//! raw accumulators; this module adds what the device does after the
//! multiply-accumulate stage: convolution pooling, the piecewise-linear
//! activation and the saturating store to the output width.

use gna_chip::{DataWidth, HwOperation};

use crate::error::{GnaError, Result};
use crate::kernels::{pwl, write_saturated, KernelConfig, KernelFn, KernelShape, KernelTable};
use crate::memory::BufferRef;
use crate::model::{CompiledModel, Layer, PoolingKind};
use crate::partition::{SubModel, SubModelKind};
use crate::pool::WorkerBuffers;
use crate::request::RequestConfiguration;

/// Score every layer of a software run. Returns the number of saturated
/// values.
///
/// # Errors
///
/// Returns `GnaError::InvalidConfiguration` for layers without an input or
/// output buffer and for active lists naming outputs the layer lacks. Every
/// error carries the layer index.
pub fn execute_run(
    model: &CompiledModel,
    run: &SubModel,
    config: &RequestConfiguration,
    kernels: &KernelTable,
    buffers: &mut WorkerBuffers,
) -> Result<u32> {
    if run.kind != SubModelKind::Software {
        return Err(GnaError::invalid_configuration(format!(
            "{:?} run given to software execution",
            run.kind
        )));
    }
    let mut saturations = 0;
    for index in run.layers() {
        let layer = model
            .layers()
            .get(index)
            .ok_or_else(|| GnaError::invalid_identifier("layer", index as u64))?;
        saturations += execute_layer(layer, config, kernels, buffers)
            .map_err(|e| e.in_layer(index))?;
    }
    Ok(saturations)
}

fn execute_layer(
    layer: &Layer,
    config: &RequestConfiguration,
    kernels: &KernelTable,
    buffers: &mut WorkerBuffers,
) -> Result<u32> {
    let input = config
        .input_of(layer)
        .ok_or_else(|| GnaError::invalid_configuration("input buffer not set"))?;
    let output = config
        .output_of(layer)
        .ok_or_else(|| GnaError::invalid_configuration("output buffer not set"))?;

    input.with_len(layer.input.len).read_into(&mut buffers.input)?;
    stage(layer.weights.as_ref(), &mut buffers.weights)?;
    stage(layer.biases.as_ref(), &mut buffers.biases)?;
    stage(layer.extra.as_ref(), &mut buffers.extra)?;
    load_activation(layer, buffers)?;
    let active = load_active_list(layer, config, buffers)?;

    let policy = config.policy();
    let kernel = kernels
        .map(layer.kind, layer.mode)
        .get(policy.kernel, policy.consistent);
    let shape = layer.shape;
    let rows = if active { buffers.active.len() } else { shape.outputs };

    let sum_len = match layer.kind {
        HwOperation::Convolution1D => shape.positions() * shape.outputs,
        HwOperation::Transposition => shape.vectors * shape.inputs,
        HwOperation::Affine | HwOperation::Gmm => shape.vectors * rows,
        _ => shape.vectors * shape.outputs,
    };
    buffers.sums.clear();
    buffers.sums.resize(sum_len, 0);

    let WorkerBuffers {
        input: staged,
        weights,
        biases,
        extra,
        segments,
        output: bytes,
        sums,
        pool,
        feedback,
        active: active_rows,
    } = buffers;

    let base = KernelConfig {
        shape,
        mode: layer.mode,
        input: staged,
        weights,
        biases,
        extra,
        feedback: &[],
        active: active.then_some(active_rows.as_slice()),
    };

    let mut saturations = 0;
    if layer.kind == HwOperation::Recurrent {
        saturations += recurrent(layer, &base, segments, sums, feedback, kernel);
    } else {
        saturations += kernel(&base, sums);
    }

    let values: &mut Vec<i64> = match (layer.kind, layer.pooling) {
        (HwOperation::Convolution1D, Some(pooling)) => {
            let positions = shape.positions();
            let pooled = pooling.output_positions(positions);
            let filters = shape.outputs;
            pool.clear();
            pool.resize(pooled * filters, 0);
            for q in 0..pooled {
                let start = q * pooling.stride;
                let end = (start + pooling.size).min(positions);
                for f in 0..filters {
                    let window = (start..end).map(|p| sums[p * filters + f]);
                    pool[q * filters + f] = match pooling.kind {
                        PoolingKind::Max => window.max().unwrap_or(0),
                        PoolingKind::Sum => window.sum(),
                    };
                }
            }
            pool
        }
        _ => sums,
    };

    // recurrent outputs were activated step by step
    if layer.kind != HwOperation::Recurrent && !segments.is_empty() {
        for value in values.iter_mut() {
            *value = pwl::activate(segments, *value);
        }
    }

    let width = layer.output.width;
    bytes.clear();
    if layer.kind == HwOperation::Gmm {
        bytes.reserve(values.len() * 4);
        for &value in values.iter() {
            bytes.extend_from_slice(&score(value).to_le_bytes());
        }
    } else {
        bytes.resize(values.len() * width.bytes(), 0);
        for (i, &value) in values.iter().enumerate() {
            if write_saturated(bytes, width, i, value) {
                saturations += 1;
            }
        }
    }
    output.write(bytes)?;

    tracing::trace!(
        "Layer {} ({}) scored {} values, {saturations} saturated",
        layer.index,
        layer.kind,
        values.len()
    );
    Ok(saturations)
}

/// Run a recurrent layer one vector at a time. The feedback of vector `v`
/// is the stored output of vector `v - delay`, zero before that.
fn recurrent(
    layer: &Layer,
    base: &KernelConfig<'_>,
    segments: &[pwl::PwlSegment],
    sums: &mut [i64],
    history: &mut Vec<i64>,
    kernel: KernelFn,
) -> u32 {
    let shape = base.shape;
    let outputs = shape.outputs;
    let step_input = shape.inputs * base.mode.input.bytes();
    history.clear();
    history.resize(shape.vectors * outputs, 0);

    let mut saturations = 0;
    for v in 0..shape.vectors {
        let feedback = v
            .checked_sub(layer.delay)
            .map_or(&[][..], |previous| &history[previous * outputs..(previous + 1) * outputs]);
        let step = KernelConfig {
            shape: KernelShape { vectors: 1, ..shape },
            input: &base.input[v * step_input..(v + 1) * step_input],
            feedback,
            ..*base
        };
        let out = &mut sums[v * outputs..(v + 1) * outputs];
        saturations += kernel(&step, out);
        for value in out.iter_mut() {
            *value = pwl::activate(segments, *value);
        }
        let (min, max) = match layer.output.width {
            DataWidth::Int8 => (i64::from(i8::MIN), i64::from(i8::MAX)),
            _ => (i64::from(i16::MIN), i64::from(i16::MAX)),
        };
        for (stored, &value) in history[v * outputs..(v + 1) * outputs].iter_mut().zip(out.iter()) {
            *stored = value.clamp(min, max);
        }
    }
    saturations
}

fn stage(buffer: Option<&BufferRef>, dst: &mut Vec<u8>) -> Result<()> {
    match buffer {
        Some(buffer) => buffer.read_into(dst),
        None => {
            dst.clear();
            Ok(())
        }
    }
}

fn load_activation(layer: &Layer, buffers: &mut WorkerBuffers) -> Result<()> {
    buffers.segments.clear();
    if let Some(activation) = &layer.activation {
        activation.buffer.read_into(&mut buffers.output)?;
        buffers.segments = pwl::decode_segments(&buffers.output);
    }
    Ok(())
}

/// Stage the active list of `layer`, if the configuration sets one.
fn load_active_list(
    layer: &Layer,
    config: &RequestConfiguration,
    buffers: &mut WorkerBuffers,
) -> Result<bool> {
    buffers.active.clear();
    let Some(list) = config.active_list(layer.index) else {
        return Ok(false);
    };
    list.buffer.read_into(&mut buffers.output)?;
    let outputs = layer.shape.outputs;
    for chunk in buffers.output.chunks_exact(4).take(list.count) {
        let row = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if row as usize >= outputs {
            return Err(GnaError::invalid_configuration(format!(
                "active list names output {row} of {outputs}"
            )));
        }
        buffers.active.push(row);
    }
    Ok(true)
}

/// GMM scores are unsigned 32-bit; the maximum-score ceiling already
/// bounds them, so clamping here is not a saturation.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn score(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}
