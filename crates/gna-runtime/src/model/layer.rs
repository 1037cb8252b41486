//! Validated layers
//!
//! Compiling an [`Operation`] checks every shape and width, resolves each
//! bound tensor to its allocation, and fixes the kernel dimensions. Errors
//! carry the layer index.

use gna_chip::{DataMode, DataWidth, HwOperation};

use super::operation::{Operand, Operation, Pooling, Tensor};
use crate::error::{GnaError, Result};
use crate::kernels::{KernelShape, KernelTable};
use crate::memory::{BufferRef, MemoryArena};

/// Largest number of input vectors a layer may group.
pub const MAX_VECTORS: usize = 8;

/// Largest number of activation segments.
pub const MAX_PWL_SEGMENTS: usize = 128;

/// Input or output of a layer, bound at compile time or per request.
#[derive(Debug, Clone)]
pub struct LayerBuffer {
    /// Element width
    pub width: DataWidth,
    /// Size in bytes
    pub len: usize,
    /// Location fixed in the model, if any
    pub bound: Option<BufferRef>,
}

/// Piecewise-linear activation of a layer.
#[derive(Debug, Clone)]
pub struct Activation {
    /// Segment records
    pub buffer: BufferRef,
    /// Number of segments
    pub segment_count: usize,
}

/// One compiled layer.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Position in the model
    pub index: usize,
    /// Operation
    pub kind: HwOperation,
    /// Operand widths
    pub mode: DataMode,
    /// Kernel dimensions
    pub shape: KernelShape,
    /// Input vectors
    pub input: LayerBuffer,
    /// Output vectors
    pub output: LayerBuffer,
    /// Weights, filters or GMM means
    pub weights: Option<BufferRef>,
    /// Biases or GMM constants
    pub biases: Option<BufferRef>,
    /// GMM inverse covariances
    pub extra: Option<BufferRef>,
    /// Activation
    pub activation: Option<Activation>,
    /// Convolution pooling
    pub pooling: Option<Pooling>,
    /// Recurrent feedback delay
    pub delay: usize,
}

impl Layer {
    /// Validate and compile one operation.
    ///
    /// # Errors
    ///
    /// Returns a `GnaError::Layer` wrapping the reason the operation was
    /// rejected.
    pub fn compile(
        index: usize,
        operation: &Operation,
        arena: &MemoryArena,
        kernels: &KernelTable,
    ) -> Result<Self> {
        Builder {
            operation,
            arena,
        }
        .build(index, kernels)
        .map_err(|e| e.in_layer(index))
    }

    /// Input vectors.
    #[must_use]
    pub const fn vectors(&self) -> usize {
        self.shape.vectors
    }

    /// Output elements per vector, after pooling. For transpositions, the
    /// element count of the whole output.
    #[must_use]
    pub fn output_elements(&self) -> usize {
        match self.kind {
            HwOperation::Convolution1D => {
                let positions = self.shape.positions();
                let pooled = self
                    .pooling
                    .map_or(positions, |p| p.output_positions(positions));
                pooled * self.shape.outputs
            }
            HwOperation::Transposition => self.shape.vectors * self.shape.inputs,
            _ => self.shape.outputs,
        }
    }

    /// Buffers fixed in the model: parameters plus bound inputs and outputs.
    pub fn static_buffers(&self) -> impl Iterator<Item = &BufferRef> {
        [
            self.input.bound.as_ref(),
            self.output.bound.as_ref(),
            self.weights.as_ref(),
            self.biases.as_ref(),
            self.extra.as_ref(),
            self.activation.as_ref().map(|a| &a.buffer),
        ]
        .into_iter()
        .flatten()
    }
}

struct Builder<'a> {
    operation: &'a Operation,
    arena: &'a MemoryArena,
}

impl Builder<'_> {
    fn required(&self, operand: Operand) -> Result<&Tensor> {
        self.operation.operand(operand).ok_or_else(|| {
            GnaError::invalid_model(format!(
                "{} layer needs a {operand:?} operand",
                self.operation.kind
            ))
        })
    }

    fn parameter(&self, operand: Operand) -> Result<Option<BufferRef>> {
        let Some(tensor) = self.operation.operand(operand) else {
            return Ok(None);
        };
        let address = tensor
            .address
            .ok_or_else(|| GnaError::invalid_model(format!("{operand:?} must be bound")))?;
        self.arena.resolve(address, tensor.byte_len()).map(Some)
    }

    fn io(&self, tensor: &Tensor) -> Result<LayerBuffer> {
        let bound = tensor
            .address
            .map(|address| self.arena.resolve(address, tensor.byte_len()))
            .transpose()?;
        Ok(LayerBuffer {
            width: tensor.width,
            len: tensor.byte_len(),
            bound,
        })
    }

    fn build(self, index: usize, kernels: &KernelTable) -> Result<Layer> {
        let op = self.operation;
        let kind = op.kind;
        let input = self.required(Operand::Input)?;
        let output = self.required(Operand::Output)?;
        let (rows, columns) = matrix(input, "input")?;
        let (out_rows, out_columns) = matrix(output, "output")?;

        let weights_operand = if kind == HwOperation::Gmm {
            Operand::InverseCovariances
        } else {
            Operand::Weights
        };
        let weight_width = op
            .operand(weights_operand)
            .map_or(DataWidth::Disabled, |t| t.width);
        let bias_operand = if kind == HwOperation::Gmm {
            Operand::Constants
        } else {
            Operand::Biases
        };
        let bias_width = op
            .operand(bias_operand)
            .map_or(DataWidth::Disabled, |t| t.width);
        let mode = DataMode::new(input.width, weight_width, bias_width);
        if !kernels.contains(kind, mode) {
            return Err(GnaError::unsupported(format!("{kind} with data mode {mode}")));
        }

        let mut shape = KernelShape {
            vectors: rows,
            inputs: columns,
            ..KernelShape::default()
        };
        let vectors = if kind == HwOperation::Transposition {
            rows.min(columns)
        } else {
            rows
        };
        if vectors == 0 || vectors > MAX_VECTORS {
            return Err(GnaError::invalid_model(format!(
                "{vectors} input vectors, accepted 1..={MAX_VECTORS}"
            )));
        }
        if columns == 0 {
            return Err(GnaError::invalid_model("input vectors are empty"));
        }

        let mut weights = None;
        let mut biases = None;
        let mut extra = None;
        let mut pooling = None;
        let delay = op.parameters.delay;

        match kind {
            HwOperation::Affine | HwOperation::AffineDiagonal | HwOperation::Recurrent => {
                let w = self.required(Operand::Weights)?;
                shape.outputs = out_columns;
                let expected = match kind {
                    HwOperation::Affine => vec![out_columns, columns],
                    HwOperation::AffineDiagonal => vec![columns],
                    _ => vec![out_columns, columns + out_columns],
                };
                expect_shape(w, &expected, "weights")?;
                if kind == HwOperation::AffineDiagonal && out_columns != columns {
                    return Err(GnaError::invalid_model(
                        "diagonal layer must keep the vector length",
                    ));
                }
                if kind == HwOperation::Recurrent {
                    if delay == 0 {
                        return Err(GnaError::invalid_model("feedback delay must be at least 1"));
                    }
                    if op.operand(Operand::Activation).is_none() {
                        return Err(GnaError::invalid_model(
                            "recurrent layer needs an activation",
                        ));
                    }
                }
                expect_rows(out_rows, rows)?;
                weights = self.parameter(Operand::Weights)?;
                if let Some(b) = op.operand(Operand::Biases) {
                    expect_shape(b, &[out_columns], "biases")?;
                }
                biases = self.parameter(Operand::Biases)?;
            }
            HwOperation::Convolution1D => {
                if rows != 1 {
                    return Err(GnaError::invalid_model("convolution takes a single vector"));
                }
                let filters = self.required(Operand::Weights)?;
                let (filter_count, filter_size) = matrix(filters, "filters")?;
                let stride = op.parameters.stride;
                if filter_size == 0 || filter_size > columns || stride == 0 {
                    return Err(GnaError::invalid_model(format!(
                        "filter size {filter_size} / stride {stride} invalid for {columns} inputs"
                    )));
                }
                shape.outputs = filter_count;
                shape.filter_size = filter_size;
                shape.stride = stride;
                if let Some(p) = op.parameters.pooling {
                    if p.size == 0 || p.stride == 0 {
                        return Err(GnaError::invalid_model("pooling window must be non-empty"));
                    }
                    pooling = Some(p);
                }
                let positions = shape.positions();
                let pooled = pooling.map_or(positions, |p| p.output_positions(positions));
                if output.element_count() != pooled * filter_count {
                    return Err(GnaError::invalid_model(format!(
                        "output holds {} elements, convolution produces {}",
                        output.element_count(),
                        pooled * filter_count
                    )));
                }
                weights = self.parameter(Operand::Weights)?;
                if let Some(b) = op.operand(Operand::Biases) {
                    expect_shape(b, &[filter_count], "biases")?;
                }
                biases = self.parameter(Operand::Biases)?;
            }
            HwOperation::Copy => {
                expect_rows(out_rows, rows)?;
                if out_columns == 0 || out_columns > columns {
                    return Err(GnaError::invalid_model(format!(
                        "copy of {out_columns} elements from {columns}-element vectors"
                    )));
                }
                shape.outputs = out_columns;
            }
            HwOperation::Transposition => {
                if (out_rows, out_columns) != (columns, rows) {
                    return Err(GnaError::invalid_model("transposed output shape mismatch"));
                }
                shape.outputs = columns;
            }
            HwOperation::Gmm => {
                let means = self.required(Operand::Means)?;
                let ivars = self.required(Operand::InverseCovariances)?;
                let constants = self.required(Operand::Constants)?;
                let [states, mixtures, features] = means.shape[..] else {
                    return Err(GnaError::invalid_model("means must be [states, mixtures, features]"));
                };
                if features != columns || mixtures == 0 || states == 0 {
                    return Err(GnaError::invalid_model("means do not match feature vectors"));
                }
                if means.width != DataWidth::Int8 {
                    return Err(GnaError::unsupported("GMM means must be 8-bit"));
                }
                expect_shape(ivars, &[states, mixtures, features], "inverse covariances")?;
                expect_shape(constants, &[states, mixtures], "constants")?;
                expect_rows(out_rows, rows)?;
                if out_columns != states {
                    return Err(GnaError::invalid_model("GMM output must hold one score per state"));
                }
                shape.outputs = states;
                shape.mixtures = mixtures;
                shape.max_score = op.parameters.max_score;
                weights = self.parameter(Operand::Means)?;
                extra = self.parameter(Operand::InverseCovariances)?;
                biases = self.parameter(Operand::Constants)?;
            }
        }

        let activation = self.activation()?;
        let expected_output = match (kind, &activation) {
            (HwOperation::Copy | HwOperation::Transposition, _) => Some(input.width),
            (HwOperation::Gmm, _) | (_, None) => Some(DataWidth::Int32),
            (_, Some(_)) => None,
        };
        match expected_output {
            Some(width) if output.width != width => {
                return Err(GnaError::unsupported(format!(
                    "{kind} output must be {width}, got {}",
                    output.width
                )))
            }
            None if !matches!(output.width, DataWidth::Int8 | DataWidth::Int16) => {
                return Err(GnaError::unsupported(format!(
                    "activated output must be i8 or i16, got {}",
                    output.width
                )))
            }
            _ => {}
        }
        if activation.is_some() && !kind.has_activation() {
            return Err(GnaError::invalid_model(format!("{kind} takes no activation")));
        }

        let input = self.io(input)?;
        let output = self.io(output)?;
        if let Some(out) = &output.bound {
            let sources = [input.bound.as_ref(), weights.as_ref(), biases.as_ref()];
            if sources.into_iter().flatten().any(|b| b.overlaps(out)) {
                return Err(GnaError::invalid_model(
                    "output overlaps the input, weights or biases",
                ));
            }
        }

        Ok(Layer {
            index,
            kind,
            mode,
            shape,
            input,
            output,
            weights,
            biases,
            extra,
            activation,
            pooling,
            delay,
        })
    }

    fn activation(&self) -> Result<Option<Activation>> {
        let Some(tensor) = self.operation.operand(Operand::Activation) else {
            return Ok(None);
        };
        let segment_count = tensor.element_count();
        if tensor.width != DataWidth::PwlSegment
            || segment_count == 0
            || segment_count > MAX_PWL_SEGMENTS
        {
            return Err(GnaError::invalid_model(format!(
                "activation needs 1..={MAX_PWL_SEGMENTS} segments"
            )));
        }
        let buffer = self
            .parameter(Operand::Activation)?
            .ok_or_else(|| GnaError::invalid_model("activation must be bound"))?;
        Ok(Some(Activation {
            buffer,
            segment_count,
        }))
    }
}

fn matrix(tensor: &Tensor, name: &str) -> Result<(usize, usize)> {
    match tensor.shape[..] {
        [rows, columns] => Ok((rows, columns)),
        _ => Err(GnaError::invalid_model(format!(
            "{name} must be two-dimensional, got {:?}",
            tensor.shape
        ))),
    }
}

fn expect_shape(tensor: &Tensor, expected: &[usize], name: &str) -> Result<()> {
    if tensor.shape == expected {
        Ok(())
    } else {
        Err(GnaError::invalid_model(format!(
            "{name} shape {:?}, expected {expected:?}",
            tensor.shape
        )))
    }
}

fn expect_rows(out_rows: usize, rows: usize) -> Result<()> {
    if out_rows == rows {
        Ok(())
    } else {
        Err(GnaError::invalid_model(format!(
            "output has {out_rows} vectors, input {rows}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::SoftwareModes;
    use crate::model::{Parameters, PoolingKind};

    fn setup() -> (MemoryArena, KernelTable, usize) {
        let mut arena = MemoryArena::new();
        let base = arena.allocate(4096).unwrap().address();
        (arena, KernelTable::new(SoftwareModes::generic_only()), base)
    }

    fn affine(base: usize, vectors: usize) -> Operation {
        Operation::affine(
            Tensor::new(&[vectors, 4], DataWidth::Int16),
            Tensor::new(&[vectors, 2], DataWidth::Int32),
            Tensor::new(&[2, 4], DataWidth::Int16).at(base),
            Tensor::new(&[2], DataWidth::Int32).at(base + 64),
        )
    }

    #[test]
    fn affine_compiles_with_unbound_io() {
        let (arena, kernels, base) = setup();
        let layer = Layer::compile(0, &affine(base, 2), &arena, &kernels).unwrap();
        assert_eq!(layer.shape.outputs, 2);
        assert_eq!(layer.vectors(), 2);
        assert!(layer.input.bound.is_none());
        assert_eq!(layer.static_buffers().count(), 2);
    }

    #[test]
    fn too_many_vectors_is_a_layer_error() {
        let (arena, kernels, base) = setup();
        let err = Layer::compile(4, &affine(base, 9), &arena, &kernels).unwrap_err();
        assert_eq!(err.layer_index(), Some(4));
        assert_eq!(err.status(), crate::Status::ErrorModelInvalid);
    }

    #[test]
    fn output_may_not_overlap_weights() {
        let (arena, kernels, base) = setup();
        let mut op = affine(base, 1);
        op.operands.insert(
            Operand::Output,
            Tensor::new(&[1, 2], DataWidth::Int32).at(base + 8),
        );
        let err = Layer::compile(0, &op, &arena, &kernels).unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn parameters_must_be_in_known_memory() {
        let (arena, kernels, base) = setup();
        let mut op = affine(base, 1);
        op.operands.insert(
            Operand::Weights,
            Tensor::new(&[2, 4], DataWidth::Int16).at(base + 4090),
        );
        let err = Layer::compile(0, &op, &arena, &kernels).unwrap_err();
        assert_eq!(err.status(), crate::Status::ErrorMemoryOutOfBounds);
    }

    #[test]
    fn unsupported_widths_are_rejected() {
        let (arena, kernels, base) = setup();
        let op = Operation::affine(
            Tensor::new(&[1, 4], DataWidth::Int32),
            Tensor::new(&[1, 2], DataWidth::Int32),
            Tensor::new(&[2, 4], DataWidth::Int16).at(base),
            Tensor::new(&[2], DataWidth::Int32).at(base + 64),
        );
        let err = Layer::compile(0, &op, &arena, &kernels).unwrap_err();
        assert_eq!(err.status(), crate::Status::ErrorUnsupportedOperation);
    }

    #[test]
    fn convolution_output_accounts_for_pooling() {
        let (arena, kernels, base) = setup();
        let op = Operation::new(HwOperation::Convolution1D)
            .with(Operand::Input, Tensor::new(&[1, 16], DataWidth::Int16))
            .with(Operand::Output, Tensor::new(&[4, 2], DataWidth::Int32))
            .with(Operand::Weights, Tensor::new(&[2, 4], DataWidth::Int16).at(base))
            .with_parameters(Parameters {
                stride: 2,
                pooling: Some(Pooling {
                    kind: PoolingKind::Max,
                    size: 2,
                    stride: 2,
                }),
                ..Parameters::default()
            });
        let layer = Layer::compile(0, &op, &arena, &kernels).unwrap();
        assert_eq!(layer.shape.positions(), 7);
        assert_eq!(layer.output_elements(), 8);
    }
}
