//! Compiled models

use std::collections::HashMap;
use std::sync::Arc;

use gna_chip::HwOperation;
use parking_lot::RwLock;

use super::{Layer, ModelDescription, ModelId};
use crate::error::{GnaError, Result};
use crate::hardware_model::{HardwareModel, HardwareTarget};
use crate::kernels::KernelTable;
use crate::memory::{MemoryArena, MemoryContainer};
use crate::partition::{partition, CapabilityTable, SubModel, SubModelKind};

/// A validated model.
#[derive(Debug)]
pub struct CompiledModel {
    id: ModelId,
    layers: Vec<Layer>,
    gmm_count: usize,
    memory: MemoryContainer,
    partitions: RwLock<HashMap<CapabilityTable, Arc<[SubModel]>>>,
    hardware: Option<HardwareModel>,
}

impl CompiledModel {
    /// Compile every operation and, when `target` is given and any layer
    /// can run on it, the hardware descriptors.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidModel` for an empty model and the first
    /// layer error otherwise.
    pub fn compile(
        id: ModelId,
        description: &ModelDescription,
        arena: &MemoryArena,
        kernels: &KernelTable,
        target: Option<HardwareTarget>,
    ) -> Result<Self> {
        if description.operations.is_empty() {
            return Err(GnaError::invalid_model("model has no operations"));
        }
        let layers = description
            .operations
            .iter()
            .enumerate()
            .map(|(index, op)| Layer::compile(index, op, arena, kernels))
            .collect::<Result<Vec<_>>>()?;
        let gmm_count = layers.iter().filter(|l| l.kind == HwOperation::Gmm).count();

        let mut memory = MemoryContainer::new();
        for buffer in layers.iter().flat_map(Layer::static_buffers) {
            memory.emplace(buffer.memory());
        }

        let mut model = Self {
            id,
            layers,
            gmm_count,
            memory,
            partitions: RwLock::new(HashMap::new()),
            hardware: None,
        };

        if let Some(target) = target {
            let runs = model.partition(&CapabilityTable::hardware(target.version));
            if runs.iter().any(|r| r.kind != SubModelKind::Software) {
                model.hardware = Some(HardwareModel::build(
                    &model.layers,
                    &model.memory,
                    &runs,
                    target,
                )?);
            }
        }

        tracing::info!(
            "Compiled {id}: {} layers ({} GMM), {} memory regions, hardware descriptors: {}",
            model.layers.len(),
            model.gmm_count,
            model.memory.len(),
            model.hardware.is_some()
        );
        Ok(model)
    }

    /// Handle.
    #[must_use]
    pub const fn id(&self) -> ModelId {
        self.id
    }

    /// Layers in execution order.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Number of layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Number of GMM layers.
    #[must_use]
    pub const fn gmm_count(&self) -> usize {
        self.gmm_count
    }

    /// Allocations the model's parameters live in.
    #[must_use]
    pub const fn memory(&self) -> &MemoryContainer {
        &self.memory
    }

    /// Hardware descriptors, if built.
    #[must_use]
    pub const fn hardware(&self) -> Option<&HardwareModel> {
        self.hardware.as_ref()
    }

    /// Runs for `table`, computed once per table.
    pub fn partition(&self, table: &CapabilityTable) -> Arc<[SubModel]> {
        if let Some(runs) = self.partitions.read().get(table) {
            return Arc::clone(runs);
        }
        let mut cache = self.partitions.write();
        Arc::clone(
            cache
                .entry(*table)
                .or_insert_with(|| partition(&self.layers, table).into()),
        )
    }
}

#[cfg(test)]
mod tests {
    use gna_chip::{DataWidth, DeviceVersion};

    use super::*;
    use crate::cpu::SoftwareModes;
    use crate::model::{Operation, Tensor};

    fn model(arena: &mut MemoryArena, target: Option<HardwareTarget>) -> Result<CompiledModel> {
        let base = arena.allocate(4096)?.address();
        let op = Operation::affine(
            Tensor::new(&[1, 8], DataWidth::Int16),
            Tensor::new(&[1, 4], DataWidth::Int32),
            Tensor::new(&[4, 8], DataWidth::Int16).at(base),
            Tensor::new(&[4], DataWidth::Int32).at(base + 64),
        );
        CompiledModel::compile(
            ModelId(7),
            &ModelDescription::new(vec![op.clone(), op]),
            arena,
            &KernelTable::new(SoftwareModes::generic_only()),
            target,
        )
    }

    #[test]
    fn partitions_are_memoized() {
        let mut arena = MemoryArena::new();
        let model = model(&mut arena, None).unwrap();
        let table = CapabilityTable::hardware(DeviceVersion::Gna2_0);
        let first = model.partition(&table);
        let second = model.partition(&table);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 1);

        let software = model.partition(&CapabilityTable::software(DeviceVersion::Gna2_0));
        assert_eq!(software[0].kind, SubModelKind::Software);
        assert!(!Arc::ptr_eq(&first, &software));
    }

    #[test]
    fn descriptors_need_a_target() {
        let mut arena = MemoryArena::new();
        assert!(model(&mut arena, None).unwrap().hardware().is_none());
        let model = model(
            &mut arena,
            Some(HardwareTarget::for_version(DeviceVersion::Gna2_0)),
        )
        .unwrap();
        assert!(model.hardware().is_some());
        assert_eq!(model.memory().len(), 1);
    }

    #[test]
    fn empty_models_are_rejected() {
        let err = CompiledModel::compile(
            ModelId(1),
            &ModelDescription::default(),
            &MemoryArena::new(),
            &KernelTable::new(SoftwareModes::generic_only()),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, GnaError::InvalidModel { .. }));
    }
}
