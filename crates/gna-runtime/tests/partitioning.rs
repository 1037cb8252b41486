//! Partitioning of compiled models across generations

use std::sync::Arc;

use gna_chip::{DataWidth, DeviceVersion};
use gna_runtime::partition::covers;
use gna_runtime::{
    CapabilityTable, Device, ModelDescription, ModelId, Operation, RuntimeConfig, SubModelKind,
    Tensor,
};

struct Fixture {
    device: Device,
    base: usize,
}

impl Fixture {
    fn new() -> Self {
        let device = Device::open(RuntimeConfig::software()).unwrap();
        let base = device.allocate_memory(1 << 14).unwrap();
        Self { device, base }
    }

    fn affine(&self, input: DataWidth) -> Operation {
        Operation::affine(
            Tensor::new(&[1, 8], input),
            Tensor::new(&[1, 8], DataWidth::Int32),
            Tensor::new(&[8, 8], DataWidth::Int16).at(self.base),
            Tensor::new(&[8], DataWidth::Int32).at(self.base + 256),
        )
    }

    fn gmm(&self) -> Operation {
        Operation::gmm(
            Tensor::new(&[1, 8], DataWidth::Int8),
            Tensor::new(&[1, 2], DataWidth::Int32),
            Tensor::new(&[2, 1, 8], DataWidth::Int8).at(self.base + 512),
            Tensor::new(&[2, 1, 8], DataWidth::Int8).at(self.base + 1024),
            Tensor::new(&[2, 1], DataWidth::Int32).at(self.base + 1536),
        )
    }

    fn model(&self, operations: Vec<Operation>) -> ModelId {
        self.device
            .create_model(&ModelDescription::new(operations))
            .unwrap()
    }

    fn runs(&self, model: ModelId, table: CapabilityTable) -> Vec<(SubModelKind, usize, usize)> {
        self.device
            .model(model)
            .unwrap()
            .partition(&table)
            .iter()
            .map(|r| (r.kind, r.layer_index, r.layer_count))
            .collect()
    }
}

#[test]
fn unsupported_middle_layer_splits_the_run() {
    let fx = Fixture::new();
    let model = fx.model(vec![
        fx.affine(DataWidth::Int16),
        fx.affine(DataWidth::Int8),
        fx.affine(DataWidth::Int16),
    ]);
    assert_eq!(
        fx.runs(model, CapabilityTable::hardware(DeviceVersion::Gna2_0)),
        vec![
            (SubModelKind::Hardware, 0, 1),
            (SubModelKind::Software, 1, 1),
            (SubModelKind::Hardware, 2, 1),
        ]
    );
    assert_eq!(
        fx.runs(model, CapabilityTable::hardware(DeviceVersion::Gna3_0)),
        vec![(SubModelKind::Hardware, 0, 3)]
    );
}

#[test]
fn legacy_gmm_layers_are_submitted_one_by_one() {
    let fx = Fixture::new();
    let model = fx.model(vec![fx.gmm(), fx.gmm()]);
    assert_eq!(
        fx.runs(model, CapabilityTable::hardware(DeviceVersion::Gna1_0)),
        vec![
            (SubModelKind::GmmHardware, 0, 1),
            (SubModelKind::GmmHardware, 1, 1),
        ]
    );
    assert_eq!(
        fx.runs(model, CapabilityTable::hardware(DeviceVersion::Gna2_0)),
        vec![(SubModelKind::Hardware, 0, 2)]
    );
}

#[test]
fn every_generation_covers_every_layer() {
    let fx = Fixture::new();
    let model = fx.model(vec![
        fx.affine(DataWidth::Int16),
        fx.gmm(),
        fx.affine(DataWidth::Int8),
        fx.gmm(),
    ]);
    let compiled = fx.device.model(model).unwrap();
    for version in DeviceVersion::ALL {
        for table in [CapabilityTable::hardware(version), CapabilityTable::software(version)] {
            let runs = compiled.partition(&table);
            assert!(covers(&runs, 4), "{table:?}: {runs:?}");
        }
    }
}

#[test]
fn software_table_yields_one_run() {
    let fx = Fixture::new();
    let model = fx.model(vec![fx.affine(DataWidth::Int16), fx.gmm()]);
    assert_eq!(
        fx.runs(model, CapabilityTable::software(DeviceVersion::Gna3_0)),
        vec![(SubModelKind::Software, 0, 2)]
    );
}

#[test]
fn partitions_are_memoized_per_table() {
    let fx = Fixture::new();
    let model = fx.model(vec![fx.affine(DataWidth::Int16)]);
    let compiled = fx.device.model(model).unwrap();
    let table = CapabilityTable::hardware(DeviceVersion::Gna2_0);

    let first = compiled.partition(&table);
    let again = compiled.partition(&table);
    assert!(Arc::ptr_eq(&first, &again));

    let other = compiled.partition(&CapabilityTable::software(DeviceVersion::Gna2_0));
    assert!(!Arc::ptr_eq(&first, &other));
}
