//! Hardware half of a compiled model
//!
//! Owns the descriptor memory of one generation, the memory container the
//! device addresses (descriptors first, then the model's parameters) and
//! the cached [`HardwareRequest`] of every request configuration that has
//! submitted to it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gna_chip::{DescriptorLayout, DeviceVersion, GmmPlacement, HardwareCapabilities, HwOperation};
use gna_driver::protocol::Submission;
use gna_driver::{DriverCapabilities, DriverError, DriverInterface, SubmitResult};
use parking_lot::Mutex;

use crate::descriptor::{DescriptorArena, LayerWriter, Slot};
use crate::error::{GnaError, Result};
use crate::memory::{BufferRef, HostMemory, MemoryContainer};
use crate::model::Layer;
use crate::partition::{SubModel, SubModelKind};
use crate::profiler::{InstrumentationPoint, RequestProfiler};
use crate::request::{ConfigId, HardwareRequest, RequestConfiguration};

/// Pause between submissions the driver refused as busy.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Generation and input-buffer size descriptors are compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareTarget {
    /// Generation
    pub version: DeviceVersion,
    /// Device input buffer in bytes
    pub buffer_bytes: usize,
}

impl HardwareTarget {
    /// Target with the generation's default input buffer.
    #[must_use]
    pub const fn for_version(version: DeviceVersion) -> Self {
        Self {
            version,
            buffer_bytes: HardwareCapabilities::for_version(version).input_buffer_bytes(),
        }
    }

    /// Target matching an open device.
    #[must_use]
    pub const fn from_capabilities(caps: &DriverCapabilities) -> Self {
        Self {
            version: caps.device_version,
            buffer_bytes: caps.buffer_size_bytes(),
        }
    }
}

/// Device offset of `buffer` within `container`.
pub(crate) fn device_offset(container: &MemoryContainer, buffer: &BufferRef) -> Result<u32> {
    let offset = container
        .buffer_offset(buffer.address(), buffer.len(), true, 0)?
        .ok_or_else(|| {
            GnaError::out_of_bounds(format!(
                "buffer {:#x} is outside the device-visible memory",
                buffer.address()
            ))
        })?;
    u32::try_from(offset)
        .map_err(|_| GnaError::out_of_bounds(format!("device offset {offset:#x} exceeds 32 bits")))
}

/// Descriptors and request cache of one model on one generation.
#[derive(Debug)]
pub struct HardwareModel {
    target: HardwareTarget,
    descriptors: DescriptorArena,
    descriptor_memory: Arc<HostMemory>,
    container: MemoryContainer,
    slots: Vec<Option<Slot>>,
    requests: Mutex<HashMap<ConfigId, HardwareRequest>>,
}

impl HardwareModel {
    /// Write the descriptors of every layer in a non-software run of `runs`.
    /// Slots of software layers stay reserved and zeroed.
    ///
    /// # Errors
    ///
    /// Returns the first layer error, tagged with its index.
    pub fn build(
        layers: &[Layer],
        memory: &MemoryContainer,
        runs: &[SubModel],
        target: HardwareTarget,
    ) -> Result<Self> {
        let layout = DescriptorLayout::for_version(target.version);
        let gmm_count = layers.iter().filter(|l| l.kind == HwOperation::Gmm).count();
        let mut descriptors = DescriptorArena::new(layout, layers.len(), gmm_count);
        let descriptor_memory = Arc::new(HostMemory::new(descriptors.bytes().len())?);

        let mut container = MemoryContainer::new();
        container.emplace(&descriptor_memory);
        container.append(memory);

        let mut on_device = vec![false; layers.len()];
        for run in runs.iter().filter(|r| r.kind != SubModelKind::Software) {
            for index in run.layers() {
                on_device[index] = true;
            }
        }

        let mut slots = Vec::with_capacity(layers.len());
        let mut gmm_ordinal = 0;
        for layer in layers {
            let gmm_block = if layer.kind == HwOperation::Gmm {
                let block = match layout.gmm_placement {
                    GmmPlacement::ConfigArea => descriptors.gmm_config_offset(gmm_ordinal),
                    GmmPlacement::InSlot { offset } => descriptors.xnn_offset(layer.index) + offset,
                };
                gmm_ordinal += 1;
                Some(block)
            } else {
                None
            };
            if !on_device[layer.index] {
                slots.push(None);
                continue;
            }
            let slot = Slot {
                xnn: descriptors.xnn_offset(layer.index),
                gmm_block,
            };
            LayerWriter {
                arena: &mut descriptors,
                layer,
                slot,
                offset_of: |buffer: &BufferRef| device_offset(&container, buffer),
                buffer_bytes: target.buffer_bytes,
            }
            .write()?;
            slots.push(Some(slot));
        }
        descriptor_memory.write(0, descriptors.bytes())?;

        tracing::debug!(
            "Built {} descriptors for {} ({} bytes)",
            slots.iter().flatten().count(),
            target.version,
            descriptors.bytes().len()
        );
        Ok(Self {
            target,
            descriptors,
            descriptor_memory,
            container,
            slots,
            requests: Mutex::new(HashMap::new()),
        })
    }

    /// Generation compiled for.
    #[must_use]
    pub const fn version(&self) -> DeviceVersion {
        self.target.version
    }

    /// Static descriptor bytes.
    #[must_use]
    pub const fn descriptors(&self) -> &DescriptorArena {
        &self.descriptors
    }

    /// Allocation the device reads descriptors from.
    #[must_use]
    pub const fn descriptor_memory(&self) -> &Arc<HostMemory> {
        &self.descriptor_memory
    }

    /// Device-visible memory of the model.
    #[must_use]
    pub const fn container(&self) -> &MemoryContainer {
        &self.container
    }

    /// Records of a layer, `None` for software layers.
    #[must_use]
    pub fn slot(&self, layer: usize) -> Option<Slot> {
        self.slots.get(layer).copied().flatten()
    }

    /// Offset of a hardware layer's xNN slot.
    #[must_use]
    pub fn slot_offset(&self, layer: usize) -> Option<usize> {
        self.slot(layer).map(|s| s.xnn)
    }

    /// Offset of a hardware GMM layer's legacy config record.
    #[must_use]
    pub fn gmm_config_offset(&self, layer: usize) -> Option<usize> {
        if !self.descriptors.layout().has_gmm_config_area() {
            return None;
        }
        self.slot(layer).and_then(|s| s.gmm_block)
    }

    /// Submission record of `run` for `config`, rebuilding the cached
    /// request if the configuration changed since it was built.
    ///
    /// # Errors
    ///
    /// Propagates request compilation errors.
    pub fn submission(
        &self,
        layers: &[Layer],
        config: &RequestConfiguration,
        run: &SubModel,
    ) -> Result<Submission> {
        let mut requests = self.requests.lock();
        let request = match requests.entry(config.id()) {
            Entry::Occupied(entry) if entry.get().generation() == config.generation() => {
                entry.into_mut()
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().invalidate(self, layers, config)?;
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(HardwareRequest::new(self, layers, config)?),
        };
        request.submission(self, run)
    }

    /// Submit `run` and wait for the device. A busy device is retried
    /// until its recovery timeout runs out, which then counts as a driver
    /// timeout.
    ///
    /// # Errors
    ///
    /// Propagates request compilation and driver errors.
    pub fn submit(
        &self,
        layers: &[Layer],
        config: &RequestConfiguration,
        run: &SubModel,
        driver: &dyn DriverInterface,
        profiler: &mut RequestProfiler,
    ) -> Result<SubmitResult> {
        let submission = self.submission(layers, config, run)?;
        let payload = submission.encode();
        profiler.stamp(InstrumentationPoint::DeviceRequestReady);
        tracing::debug!(
            "{}: submitting layers {:?} ({} bytes, {} patches)",
            config.id(),
            run.layers(),
            payload.len(),
            submission.patch_count()
        );
        profiler.stamp(InstrumentationPoint::DeviceRequestSent);
        let recovery_ms = driver.capabilities().recovery_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(recovery_ms);
        let result = loop {
            match driver.submit(&payload) {
                Err(DriverError::Busy) if Instant::now() < deadline => {
                    std::thread::sleep(BUSY_RETRY_INTERVAL);
                }
                Err(DriverError::Busy) => {
                    tracing::warn!("{}: device stayed busy for {recovery_ms} ms", config.id());
                    break Err(DriverError::Timeout {
                        duration_ms: recovery_ms,
                    });
                }
                other => break other,
            }
        };
        profiler.stamp(InstrumentationPoint::DeviceRequestCompleted);
        let result = result?;
        profiler.record_driver(result.hardware_perf, &result.driver_perf);
        Ok(result)
    }

    /// Drop the cached request of a configuration.
    pub fn invalidate_request(&self, config: ConfigId) {
        self.requests.lock().remove(&config);
    }
}

#[cfg(test)]
mod tests {
    use gna_chip::{DataWidth, GmmField, XnnField};

    use super::*;
    use crate::cpu::SoftwareModes;
    use crate::kernels::KernelTable;
    use crate::memory::MemoryArena;
    use crate::model::{CompiledModel, ModelDescription, ModelId, Operation, Tensor};

    fn compile(version: DeviceVersion, ops: Vec<Operation>, arena: &MemoryArena) -> CompiledModel {
        CompiledModel::compile(
            ModelId(1),
            &ModelDescription::new(ops),
            arena,
            &KernelTable::new(SoftwareModes::generic_only()),
            Some(HardwareTarget::for_version(version)),
        )
        .unwrap()
    }

    fn affine(base: usize, input: DataWidth) -> Operation {
        Operation::affine(
            Tensor::new(&[2, 16], input),
            Tensor::new(&[2, 4], DataWidth::Int32),
            Tensor::new(&[4, 16], DataWidth::Int16).at(base),
            Tensor::new(&[4], DataWidth::Int32).at(base + 128),
        )
    }

    fn gmm(base: usize) -> Operation {
        Operation::gmm(
            Tensor::new(&[1, 8], DataWidth::Int8),
            Tensor::new(&[1, 2], DataWidth::Int32),
            Tensor::new(&[2, 3, 8], DataWidth::Int8).at(base + 512),
            Tensor::new(&[2, 3, 8], DataWidth::Int16).at(base + 1024),
            Tensor::new(&[2, 3], DataWidth::Int32).at(base + 1536),
        )
    }

    #[test]
    fn software_slots_stay_reserved() {
        let mut arena = MemoryArena::new();
        let base = arena.allocate(4096).unwrap().address();
        let model = compile(
            DeviceVersion::Gna2_0,
            vec![
                affine(base, DataWidth::Int16),
                affine(base, DataWidth::Int8),
                affine(base, DataWidth::Int16),
            ],
            &arena,
        );
        let hw = model.hardware().unwrap();
        assert_eq!(hw.descriptors().bytes().len(), 3 * 128);
        assert_eq!(hw.slot_offset(0), Some(0));
        assert_eq!(hw.slot_offset(1), None);
        assert_eq!(hw.slot_offset(2), Some(256));
        assert!(hw.descriptors().bytes()[128..256].iter().all(|&b| b == 0));

        let d = hw.descriptors();
        assert_eq!(d.read_xnn(2, XnnField::InputElementCount), Some(16));
        assert_eq!(d.read_xnn(2, XnnField::OutputElementCount), Some(4));
        assert_eq!(d.read_xnn(2, XnnField::GroupCount), Some(2));
        assert_eq!(d.read_xnn(2, XnnField::IterationCount), Some(1));
        // parameters sit one page after the descriptors
        assert_eq!(d.read_xnn(2, XnnField::WeightBuffer), Some(4096));
        assert_eq!(d.read_xnn(2, XnnField::BiasBuffer), Some(4096 + 128));
        assert_eq!(hw.descriptor_memory().to_vec()[..384], d.bytes()[..]);
    }

    #[test]
    fn legacy_gmm_uses_the_config_area() {
        let mut arena = MemoryArena::new();
        let base = arena.allocate(4096).unwrap().address();
        let model = compile(
            DeviceVersion::Gna1_0,
            vec![affine(base, DataWidth::Int16), gmm(base)],
            &arena,
        );
        let hw = model.hardware().unwrap();
        assert_eq!(hw.descriptors().bytes().len(), 3 * 128);
        let block = hw.gmm_config_offset(1).unwrap();
        assert_eq!(block, 256);
        let d = hw.descriptors();
        assert_eq!(d.read_gmm(block, GmmField::MixtureCount), Some(3));
        assert_eq!(d.read_gmm(block, GmmField::InverseCovarianceWidth), Some(1));
        assert_eq!(d.read_gmm(block, GmmField::InverseCovarianceSetStride), Some(3 * 8 * 2));
        assert_eq!(d.read_gmm(block, GmmField::MeanAddress), Some(4096 + 512));
        assert_eq!(d.read_xnn(1, XnnField::OpCode), Some(0));
    }

    #[test]
    fn gmm_in_slot_on_3x() {
        let mut arena = MemoryArena::new();
        let base = arena.allocate(4096).unwrap().address();
        let model = compile(DeviceVersion::Gna3_0, vec![gmm(base)], &arena);
        let hw = model.hardware().unwrap();
        assert_eq!(hw.gmm_config_offset(0), None);
        let slot = hw.slot(0).unwrap();
        assert_eq!(slot.gmm_block, Some(0x40));
        let d = hw.descriptors();
        assert_eq!(d.read_xnn(0, XnnField::OpCode), Some(0x08));
        assert_eq!(d.read_gmm(0x40, GmmField::VectorCount), Some(1));
    }

    #[test]
    fn build_errors_carry_the_layer() {
        let mut arena = MemoryArena::new();
        let base = arena.allocate(1 << 20).unwrap().address();
        // more inputs than the 16-bit element count holds
        let wide = Operation::affine(
            Tensor::new(&[1, 70_000], DataWidth::Int16),
            Tensor::new(&[1, 1], DataWidth::Int32),
            Tensor::new(&[1, 70_000], DataWidth::Int16).at(base),
            Tensor::new(&[1], DataWidth::Int32).at(base + 140_000),
        );
        let err = CompiledModel::compile(
            ModelId(1),
            &ModelDescription::new(vec![affine(base, DataWidth::Int16), wide]),
            &arena,
            &KernelTable::new(SoftwareModes::generic_only()),
            Some(HardwareTarget::for_version(DeviceVersion::Gna3_0)),
        )
        .unwrap_err();
        assert_eq!(err.layer_index(), Some(1));
        assert_eq!(err.status(), crate::Status::ErrorModelInvalid);
    }
}
