//! Submission records built for request configurations
//!
//! Decodes what the simulated device received and replays the descriptor
//! patches onto a copy of the static descriptors.

use std::sync::Arc;

use gna_chip::{DataWidth, DescriptorLayout, DeviceVersion, XnnField};
use gna_driver::protocol::Submission;
use gna_driver::{DriverInterface, SimulatedDriver};
use gna_runtime::{
    ConfigId, Device, InstrumentationConfig, InstrumentationPoint, ModelDescription, ModelId,
    Operand, Operation, RuntimeConfig, Tensor, TimeUnit,
};

const VERSION: DeviceVersion = DeviceVersion::Gna2_0;

struct Fixture {
    driver: Arc<SimulatedDriver>,
    device: Device,
    model: ModelId,
    io: usize,
}

impl Fixture {
    fn new() -> Self {
        let driver = Arc::new(SimulatedDriver::new(VERSION));
        let device = Device::with_driver(
            RuntimeConfig::software(),
            Some(Arc::clone(&driver) as Arc<dyn DriverInterface>),
        )
        .unwrap();
        let base = device.allocate_memory(4096).unwrap();
        let io = device.allocate_memory(4096).unwrap();
        let op = Operation::affine(
            Tensor::new(&[1, 8], DataWidth::Int16),
            Tensor::new(&[1, 4], DataWidth::Int32),
            Tensor::new(&[4, 8], DataWidth::Int16).at(base),
            Tensor::new(&[4], DataWidth::Int32).at(base + 256),
        );
        let model = device
            .create_model(&ModelDescription::new(vec![op]))
            .unwrap();
        Self {
            driver,
            device,
            model,
            io,
        }
    }

    fn config(&self, input: usize, output: usize) -> ConfigId {
        let config = self.device.create_request_config(self.model).unwrap();
        self.device
            .set_operand_buffer(config, 0, Operand::Input, self.io + input)
            .unwrap();
        self.device
            .set_operand_buffer(config, 0, Operand::Output, self.io + output)
            .unwrap();
        config
    }

    fn submit(&self, config: ConfigId) -> Submission {
        let request = self.device.enqueue(config).unwrap();
        self.device.wait(request, None).unwrap();
        self.driver.submissions().pop().unwrap()
    }

    /// Static descriptors with the submission's patches applied.
    fn patched(&self, submission: &Submission) -> Vec<u8> {
        let compiled = self.device.model(self.model).unwrap();
        let hardware = compiled.hardware().unwrap();
        let memory = hardware.descriptor_memory();
        let mut bytes = memory.to_vec();
        submission
            .apply_patches(memory.memory_id().unwrap(), &mut bytes)
            .unwrap();
        let slot = hardware.slot_offset(0).unwrap();
        bytes.split_off(slot)
    }

    /// Device offset of the I/O allocation.
    fn io_offset(&self) -> u32 {
        let compiled = self.device.model(self.model).unwrap();
        let container = compiled.hardware().unwrap().container();
        let last = container.regions().last().unwrap();
        u32::try_from(last.aligned_offset()).unwrap() + 4096
    }
}

fn field(record: &[u8], field: XnnField) -> u32 {
    DescriptorLayout::for_version(VERSION)
        .xnn(field)
        .unwrap()
        .read(record)
        .unwrap()
}

#[test]
fn patches_point_at_request_buffers() {
    let fx = Fixture::new();
    let config = fx.config(0, 512);
    let submission = fx.submit(config);

    // descriptors, parameters, request I/O
    assert_eq!(submission.buffers.len(), 3);
    assert!(submission.buffers[1..].iter().all(|b| b.patches.is_empty()));
    assert!(!submission.flags.active_list_on);

    let record = fx.patched(&submission);
    assert_eq!(field(&record, XnnField::InputBuffer), fx.io_offset());
    assert_eq!(field(&record, XnnField::OutputSumBuffer), fx.io_offset() + 512);
}

#[test]
fn rebinding_recomputes_the_patches() {
    let fx = Fixture::new();
    let config = fx.config(0, 512);
    let first = fx.patched(&fx.submit(config));

    fx.device
        .set_operand_buffer(config, 0, Operand::Output, fx.io + 1024)
        .unwrap();
    let second = fx.patched(&fx.submit(config));

    assert_eq!(
        field(&first, XnnField::InputBuffer),
        field(&second, XnnField::InputBuffer)
    );
    assert_eq!(field(&second, XnnField::OutputSumBuffer), fx.io_offset() + 1024);
}

#[test]
fn configurations_do_not_share_patches() {
    let fx = Fixture::new();
    let a = fx.config(0, 512);
    let b = fx.config(256, 768);

    let from_a = fx.patched(&fx.submit(a));
    let from_b = fx.patched(&fx.submit(b));
    let again_a = fx.patched(&fx.submit(a));

    assert_eq!(field(&from_b, XnnField::InputBuffer), fx.io_offset() + 256);
    assert_eq!(from_a, again_a);
}

#[test]
fn active_list_sets_the_run_flag() {
    let fx = Fixture::new();
    let config = fx.config(0, 512);
    fx.device
        .write(fx.io + 2048, &[1u32, 3].map(u32::to_le_bytes).concat())
        .unwrap();
    fx.device
        .enable_active_list(config, 0, fx.io + 2048, 2)
        .unwrap();

    let submission = fx.submit(config);
    assert!(submission.flags.active_list_on);
    let record = fx.patched(&submission);
    assert_eq!(field(&record, XnnField::ActiveListElementCount), 2);
    assert_eq!(field(&record, XnnField::ActiveListBuffer), fx.io_offset() + 2048);
}

#[test]
fn instrumentation_selects_device_counters() {
    let fx = Fixture::new();
    let config = fx.config(0, 512);
    assert_eq!(fx.submit(config).flags.hw_perf_encoding, 0);

    fx.device
        .set_instrumentation(
            config,
            Some(
                InstrumentationConfig::new(
                    &[InstrumentationPoint::DeviceRequestCompleted],
                    TimeUnit::Cycles,
                )
                .with_hw_perf_encoding(3),
            ),
        )
        .unwrap();
    assert_eq!(fx.submit(config).flags.hw_perf_encoding, 3);
}
