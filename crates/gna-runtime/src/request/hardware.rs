//! Request compiler
//!
//! Turns a model's static descriptors plus one request configuration into
//! submission records. Patches are computed once per configuration
//! generation and rewrite every request-dependent field of every hardware
//! layer, so a submission never depends on what an earlier request left
//! in the descriptor memory.

use std::collections::{BTreeMap, HashMap};

use gna_chip::{FieldKind, FieldLocation, GmmField, HwOperation, NnOpCode, XnnField};
use gna_driver::protocol::{
    BufferEntry, ControlFlags, MemoryPatch, PatchValue, Submission, SubmitConfig,
};

use super::config::RequestConfiguration;
use crate::error::{GnaError, Result};
use crate::hardware_model::{device_offset, HardwareModel};
use crate::memory::{BufferRef, MemoryContainer};
use crate::model::Layer;
use crate::partition::{SubModel, SubModelKind};

/// Cached submission state of one request configuration.
#[derive(Debug)]
pub struct HardwareRequest {
    generation: u64,
    container: MemoryContainer,
    patches: BTreeMap<usize, Vec<MemoryPatch>>,
    active: Vec<bool>,
    run_active: HashMap<usize, bool>,
    hw_perf_encoding: u8,
}

impl HardwareRequest {
    /// Compute the patches of `config` against `model`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidConfiguration` if a hardware layer has no
    /// input or output, and offset errors for buffers outside the request's
    /// memory.
    pub fn new(model: &HardwareModel, layers: &[Layer], config: &RequestConfiguration) -> Result<Self> {
        let mut request = Self {
            generation: config.generation(),
            container: MemoryContainer::new(),
            patches: BTreeMap::new(),
            active: vec![false; layers.len()],
            run_active: HashMap::new(),
            hw_perf_encoding: 0,
        };
        request.invalidate(model, layers, config)?;
        Ok(request)
    }

    /// Configuration generation the patches were computed for.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Memory visible to the device for this request.
    #[must_use]
    pub const fn container(&self) -> &MemoryContainer {
        &self.container
    }

    /// Descriptor patches of one layer.
    #[must_use]
    pub fn layer_patches(&self, index: usize) -> &[MemoryPatch] {
        self.patches.get(&index).map_or(&[], Vec::as_slice)
    }

    /// Recompute every patch from `config`.
    ///
    /// # Errors
    ///
    /// See [`HardwareRequest::new`].
    pub fn invalidate(
        &mut self,
        model: &HardwareModel,
        layers: &[Layer],
        config: &RequestConfiguration,
    ) -> Result<()> {
        let mut container = model.container().clone();
        for (_, layer_config) in config.layers() {
            let buffers = [
                layer_config.input.as_ref(),
                layer_config.output.as_ref(),
                layer_config.active_list.as_ref().map(|a| &a.buffer),
            ];
            for buffer in buffers.into_iter().flatten() {
                container.emplace(buffer.memory());
            }
        }

        let mut patches = BTreeMap::new();
        let mut active = vec![false; layers.len()];
        for layer in layers {
            let Some(slot) = model.slot(layer.index) else {
                continue;
            };
            let mut builder = PatchBuilder {
                model,
                container: &container,
                layer,
                patches: Vec::new(),
            };
            let has_list = builder
                .layer(config, slot.gmm_block)
                .map_err(|e| e.in_layer(layer.index))?;
            active[layer.index] = has_list;
            patches.insert(layer.index, builder.patches);
        }

        tracing::debug!(
            "{}: {} patches over {} layers",
            config.id(),
            patches.values().map(Vec::len).sum::<usize>(),
            patches.len()
        );
        self.generation = config.generation();
        self.container = container;
        self.patches = patches;
        self.active = active;
        self.run_active.clear();
        self.hw_perf_encoding = config.instrumentation().map_or(0, |i| i.hw_perf_encoding);
        Ok(())
    }

    /// Run header of `run` and whether any of its layers uses an active
    /// list. The active-list scan is cached per first layer.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidConfiguration` for software runs or runs
    /// outside the descriptor area.
    pub fn update(&mut self, model: &HardwareModel, run: &SubModel) -> Result<(SubmitConfig, bool)> {
        let offset = |value: usize| {
            u32::try_from(value)
                .map_err(|_| GnaError::out_of_bounds("descriptor offset exceeds 32 bits"))
        };
        let config = match run.kind {
            SubModelKind::Hardware => SubmitConfig::Xnn {
                layer_base: offset(
                    model
                        .slot_offset(run.layer_index)
                        .ok_or_else(|| not_hardware(run))?,
                )?,
                layer_count: offset(run.layer_count)?,
            },
            SubModelKind::GmmHardware => SubmitConfig::Gmm {
                config_offset: offset(
                    model
                        .gmm_config_offset(run.layer_index)
                        .ok_or_else(|| not_hardware(run))?,
                )?,
            },
            SubModelKind::Software => return Err(not_hardware(run)),
        };
        let active = &self.active;
        let on = *self
            .run_active
            .entry(run.layer_index)
            .or_insert_with(|| run.layers().any(|i| active.get(i).copied().unwrap_or(false)));
        Ok((config, on))
    }

    /// Submission record of one run.
    ///
    /// # Errors
    ///
    /// Fails like [`update`](Self::update), and with
    /// `GnaError::InvalidConfiguration` if a region was never mapped.
    pub fn submission(&mut self, model: &HardwareModel, run: &SubModel) -> Result<Submission> {
        let (config, active_list_on) = self.update(model, run)?;
        let mut descriptor_patches: Vec<MemoryPatch> = run
            .layers()
            .flat_map(|i| self.layer_patches(i).iter().copied())
            .collect();

        let mut buffers = Vec::with_capacity(self.container.len());
        for (position, region) in self.container.regions().iter().enumerate() {
            let memory = region.memory();
            let id = memory.memory_id().ok_or_else(|| {
                GnaError::invalid_configuration(format!(
                    "memory {:#x} is not mapped for the device",
                    memory.address()
                ))
            })?;
            let mut entry = BufferEntry::whole(id, memory.capacity() as u64);
            if position == 0 {
                entry.patches = std::mem::take(&mut descriptor_patches);
            }
            buffers.push(entry);
        }

        Ok(Submission {
            flags: ControlFlags {
                active_list_on,
                hw_perf_encoding: self.hw_perf_encoding,
            },
            config,
            buffers,
        })
    }
}

fn not_hardware(run: &SubModel) -> GnaError {
    GnaError::invalid_configuration(format!(
        "layers {:?} have no hardware descriptors",
        run.layers()
    ))
}

struct PatchBuilder<'a> {
    model: &'a HardwareModel,
    container: &'a MemoryContainer,
    layer: &'a Layer,
    patches: Vec<MemoryPatch>,
}

impl PatchBuilder<'_> {
    /// Returns whether the layer runs with an active list.
    fn layer(&mut self, config: &RequestConfiguration, gmm_block: Option<usize>) -> Result<bool> {
        let layer = self.layer;
        let input = config.input_of(layer).ok_or_else(|| {
            GnaError::invalid_configuration(format!("layer {} has no input buffer", layer.index))
        })?;
        let output = config.output_of(layer).ok_or_else(|| {
            GnaError::invalid_configuration(format!("layer {} has no output buffer", layer.index))
        })?;
        let list = config.active_list(layer.index);

        if let Some(block) = gmm_block {
            let descriptors = self.model.descriptors();
            let gmm = |field| descriptors.gmm_location(block, field);
            let (input_at, output_at) = (
                gmm(GmmField::FeatureVectorAddress),
                gmm(GmmField::ScoreAddress),
            );
            self.buffer(input_at, input)?;
            self.buffer(output_at, output)?;
            let (address, length, score_length) = (
                gmm(GmmField::ActiveListAddress),
                gmm(GmmField::ActiveListLength),
                gmm(GmmField::ScoreLength),
            );
            match list {
                Some(list) => {
                    self.buffer(address, &list.buffer)?;
                    self.value(length, list.count)?;
                    self.value(score_length, list.count)?;
                }
                None => {
                    self.value(address, 0)?;
                    self.value(length, 0)?;
                    self.value(score_length, layer.shape.outputs)?;
                }
            }
            if !self.model.descriptors().layout().has_gmm_config_area() {
                let code = if list.is_some() {
                    NnOpCode::GmmActiveList
                } else {
                    NnOpCode::Gmm
                };
                self.opcode(code)?;
            }
            return Ok(list.is_some());
        }

        self.buffer(self.xnn_field(XnnField::InputBuffer)?, input)?;
        let output_field = if layer.activation.is_some() {
            XnnField::OutputActivatedBuffer
        } else {
            XnnField::OutputSumBuffer
        };
        self.buffer(self.xnn_field(output_field)?, output)?;
        if layer.kind == HwOperation::Recurrent {
            self.buffer(self.xnn_field(XnnField::FeedbackBuffer)?, output)?;
        }

        if layer.kind.accepts_active_list() {
            let base = NnOpCode::for_operation(layer.kind, layer.shape.vectors, layer.shape.inputs);
            let buffer_at = self.xnn_field(XnnField::ActiveListBuffer)?;
            let count_at = self.xnn_field(XnnField::ActiveListElementCount)?;
            match list {
                Some(list) => {
                    self.buffer(buffer_at, &list.buffer)?;
                    self.value(count_at, list.count)?;
                    self.opcode(base.with_active_list().unwrap_or(base))?;
                }
                None => {
                    self.value(buffer_at, 0)?;
                    self.value(count_at, 0)?;
                    self.opcode(base)?;
                }
            }
        }
        Ok(list.is_some())
    }

    fn xnn_field(&self, field: XnnField) -> Result<FieldLocation> {
        self.model.descriptors().xnn_location(self.layer.index, field)
    }

    fn opcode(&mut self, code: NnOpCode) -> Result<()> {
        let at = self.xnn_field(XnnField::OpCode)?;
        self.value(at, usize::from(code.byte()))
    }

    fn buffer(&mut self, at: FieldLocation, buffer: &BufferRef) -> Result<()> {
        let offset = device_offset(self.container, buffer)?;
        self.push(at, offset)
    }

    fn value(&mut self, at: FieldLocation, value: usize) -> Result<()> {
        let value = u32::try_from(value)
            .map_err(|_| GnaError::invalid_configuration(format!("patch value {value} too large")))?;
        self.push(at, value)
    }

    /// Encode one field write as a patch. Sub-byte fields are merged into
    /// the static byte that holds them.
    fn push(&mut self, at: FieldLocation, value: u32) -> Result<()> {
        if !at.fits(value) {
            return Err(GnaError::invalid_configuration(format!(
                "value {value} does not fit the field at {:#x}",
                at.offset
            )));
        }
        let patch = match at.kind {
            FieldKind::U8 => PatchValue::U8(value as u8),
            FieldKind::U16 => PatchValue::U16(value as u16),
            FieldKind::U32 => PatchValue::U32(value),
            FieldKind::Bits { .. } => {
                let current = self
                    .model
                    .descriptors()
                    .bytes()
                    .get(at.offset)
                    .copied()
                    .ok_or_else(|| GnaError::out_of_bounds("patched field outside descriptors"))?;
                let mut byte = [current];
                FieldLocation::new(0, at.kind)
                    .write(&mut byte, value)
                    .map_err(|e| GnaError::invalid_configuration(e.to_string()))?;
                PatchValue::U8(byte[0])
            }
        };
        self.patches.push(MemoryPatch::new(at.offset as u64, patch));
        Ok(())
    }
}
