//! Per-layer descriptor writers

use gna_chip::{DataWidth, GmmField, HwOperation, NnOpCode, XnnField};

use super::arena::DescriptorArena;
use crate::error::{GnaError, Result};
use crate::memory::BufferRef;
use crate::model::Layer;

/// Largest iteration count the descriptor can hold.
pub const MAX_ITERATIONS: usize = 255;

/// Where a layer's records live in the descriptor area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Byte offset of the xNN slot
    pub xnn: usize,
    /// Byte offset of the GMM block, for GMM layers
    pub gmm_block: Option<usize>,
}

/// Split of a layer's inputs into passes through the device input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationPlan {
    /// Number of passes
    pub count: usize,
    /// Elements per full pass
    pub per_iteration: usize,
    /// Elements in the final pass
    pub last: usize,
}

impl IterationPlan {
    /// Plan `elements` inputs of `vectors` grouped vectors of `width`
    /// through a `buffer_bytes` input buffer. Full passes hold a multiple
    /// of 8 elements.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidModel` if one pass cannot hold 8 elements
    /// or more than [`MAX_ITERATIONS`] passes are needed.
    pub fn new(elements: usize, vectors: usize, width: DataWidth, buffer_bytes: usize) -> Result<Self> {
        let per_element = vectors * width.bytes();
        let per_iteration = if per_element == 0 {
            0
        } else {
            (buffer_bytes / per_element) & !7
        };
        if per_iteration == 0 {
            return Err(GnaError::invalid_model(format!(
                "{vectors} vectors of {width} do not fit a {buffer_bytes}-byte input buffer"
            )));
        }
        let count = elements.div_ceil(per_iteration).max(1);
        if count > MAX_ITERATIONS {
            return Err(GnaError::invalid_model(format!(
                "{elements} inputs need {count} iterations, the device allows {MAX_ITERATIONS}"
            )));
        }
        Ok(Self {
            count,
            per_iteration,
            last: elements - (count - 1) * per_iteration,
        })
    }

    /// Feedback split of a recurrent layer with `outputs` outputs: the
    /// first feedback pass fills the room left by the last input pass.
    /// Returns `(iterations, first, last)`.
    #[must_use]
    pub fn feedback(&self, outputs: usize) -> (usize, usize, usize) {
        let room = self.per_iteration - self.last;
        let first = room.min(outputs);
        let rest = outputs - first;
        let extra = rest.div_ceil(self.per_iteration.max(1));
        let iterations = usize::from(first > 0) + extra;
        let last = if extra == 0 {
            first
        } else {
            rest - (extra - 1) * self.per_iteration
        };
        (iterations, first, last)
    }
}

/// Writes one layer into the descriptor area.
pub(crate) struct LayerWriter<'a, F> {
    pub arena: &'a mut DescriptorArena,
    pub layer: &'a Layer,
    pub slot: Slot,
    pub offset_of: F,
    pub buffer_bytes: usize,
}

impl<F> LayerWriter<'_, F>
where
    F: Fn(&BufferRef) -> Result<u32>,
{
    /// Write every field of the layer. Errors carry the layer index.
    pub fn write(mut self) -> Result<()> {
        let index = self.layer.index;
        self.write_fields().map_err(|e| e.in_layer(index))
    }

    fn write_fields(&mut self) -> Result<()> {
        match self.layer.kind {
            HwOperation::Gmm => self.write_gmm(),
            _ => self.write_xnn(),
        }
    }

    fn xnn(&mut self, field: XnnField, value: usize) -> Result<()> {
        let value = to_u32(value, field)?;
        self.arena.write_xnn(self.layer.index, field, value)
    }

    fn gmm(&mut self, block: usize, field: GmmField, value: usize) -> Result<()> {
        let value = u32::try_from(value)
            .map_err(|_| GnaError::invalid_model(format!("{field:?} value {value} too large")))?;
        self.arena.write_gmm(block, field, value)
    }

    fn buffer(&mut self, field: XnnField, buffer: Option<&BufferRef>) -> Result<()> {
        match buffer {
            Some(b) => {
                let offset = (self.offset_of)(b)?;
                self.arena.write_xnn(self.layer.index, field, offset)
            }
            None => Ok(()),
        }
    }

    fn write_xnn(&mut self) -> Result<()> {
        let layer = self.layer;
        let shape = layer.shape;
        let version = self.arena.layout().version;

        let opcode = NnOpCode::for_operation(layer.kind, shape.vectors, shape.inputs);
        self.xnn(XnnField::OpCode, usize::from(opcode.byte()))?;

        let (inputs, groups) = if layer.kind == HwOperation::Transposition {
            (shape.vectors.max(shape.inputs), shape.vectors.min(shape.inputs))
        } else {
            (shape.inputs, shape.vectors)
        };
        self.xnn(XnnField::InputElementCount, inputs)?;
        self.xnn(XnnField::OutputElementCount, layer.output_elements())?;
        self.xnn(XnnField::GroupCount, groups)?;

        if matches!(
            layer.kind,
            HwOperation::Affine | HwOperation::AffineDiagonal | HwOperation::Recurrent
        ) {
            let plan = IterationPlan::new(
                shape.inputs,
                shape.vectors,
                layer.input.width,
                self.buffer_bytes,
            )?;
            self.xnn(XnnField::IterationCount, plan.count)?;
            self.xnn(XnnField::LastIterationElementCount, plan.last)?;
            if layer.kind == HwOperation::Recurrent {
                let (iterations, first, last) = plan.feedback(shape.outputs);
                self.xnn(XnnField::FeedbackIterationCount, iterations)?;
                self.xnn(XnnField::FeedbackFirstElementCount, first)?;
                self.xnn(XnnField::FeedbackLastElementCount, last)?;
            }
        }

        self.buffer(XnnField::InputBuffer, layer.input.bound.as_ref())?;
        let output_field = if layer.activation.is_some() {
            XnnField::OutputActivatedBuffer
        } else {
            XnnField::OutputSumBuffer
        };
        self.buffer(output_field, layer.output.bound.as_ref())?;
        if layer.kind == HwOperation::Recurrent {
            self.buffer(XnnField::FeedbackBuffer, layer.output.bound.as_ref())?;
        }

        if let Some(activation) = &layer.activation {
            self.xnn(XnnField::ActivationEnabled, 1)?;
            self.xnn(XnnField::PwlSegmentCount, activation.segment_count)?;
            self.buffer(XnnField::PwlSegmentBuffer, Some(&activation.buffer))?;
        }

        if layer.kind.has_weights() {
            self.xnn(
                XnnField::WeightSize,
                layer.mode.weight.weight_size_code() as usize,
            )?;
            self.buffer(XnnField::WeightBuffer, layer.weights.as_ref())?;
            self.buffer(XnnField::BiasBuffer, layer.biases.as_ref())?;
        }

        if version.has_precision_flags() {
            self.xnn(
                XnnField::InputPrecision,
                layer.mode.input.precision_code() as usize,
            )?;
            self.xnn(
                XnnField::BiasPrecision,
                layer.mode.bias.precision_code() as usize,
            )?;
        }

        match layer.kind {
            HwOperation::Convolution1D => {
                self.xnn(XnnField::ConvFilterCount, shape.outputs)?;
                self.xnn(XnnField::ConvFilterSize, shape.filter_size)?;
                self.xnn(XnnField::ConvStride, shape.stride)?;
                if let Some(pooling) = layer.pooling {
                    self.xnn(XnnField::PoolParam, pooling.kind.code() as usize)?;
                    self.xnn(XnnField::PoolSize, pooling.size)?;
                    self.xnn(XnnField::PoolStride, pooling.stride)?;
                }
            }
            HwOperation::Copy => self.xnn(XnnField::CopyElementCount, shape.outputs)?,
            _ => {}
        }
        Ok(())
    }

    fn write_gmm(&mut self) -> Result<()> {
        let layer = self.layer;
        let shape = layer.shape;
        let block = self
            .slot
            .gmm_block
            .ok_or_else(|| GnaError::invalid_model("GMM layer without a GMM block"))?;

        if !self.arena.layout().has_gmm_config_area() {
            self.xnn(XnnField::OpCode, usize::from(NnOpCode::Gmm.byte()))?;
        }

        let features = shape.inputs;
        let ivar_width = layer.mode.weight;
        let mixtures = shape.mixtures;
        self.gmm(block, GmmField::FeatureVectorStride, features)?;
        self.gmm(block, GmmField::FeatureVectorLength, features)?;
        self.gmm(
            block,
            GmmField::InverseCovarianceWidth,
            usize::from(ivar_width == DataWidth::Int16),
        )?;
        self.gmm(block, GmmField::ScoreLength, shape.outputs)?;
        self.gmm(block, GmmField::MixtureCount, mixtures)?;
        self.gmm(block, GmmField::VectorCount, shape.vectors)?;
        self.gmm(block, GmmField::MaximumScore, shape.max_score as usize)?;
        self.gmm(block, GmmField::MeanSetStride, mixtures * features)?;
        self.gmm(
            block,
            GmmField::InverseCovarianceSetStride,
            mixtures * features * ivar_width.bytes(),
        )?;
        self.gmm(
            block,
            GmmField::ConstantSetStride,
            mixtures * DataWidth::Int32.bytes(),
        )?;

        let buffers = [
            (GmmField::FeatureVectorAddress, layer.input.bound.as_ref()),
            (GmmField::ScoreAddress, layer.output.bound.as_ref()),
            (GmmField::MeanAddress, layer.weights.as_ref()),
            (GmmField::InverseCovarianceAddress, layer.extra.as_ref()),
            (GmmField::ConstantAddress, layer.biases.as_ref()),
        ];
        for (field, buffer) in buffers {
            if let Some(b) = buffer {
                let offset = (self.offset_of)(b)?;
                self.arena.write_gmm(block, field, offset)?;
            }
        }
        Ok(())
    }
}

fn to_u32(value: usize, field: XnnField) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| GnaError::invalid_model(format!("{field:?} value {value} too large")))
}
