//! Request dispatch end to end
//!
//! Software scoring through the public `Device` API, and hardware runs
//! against the simulated backend.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gna_chip::{status, DataMode, DataWidth, DeviceVersion, HwOperation};
use gna_driver::protocol::SubmitConfig;
use gna_driver::{DriverInterface, SimulatedDriver};
use gna_runtime::kernels::{KernelConfig, KernelTable};
use gna_runtime::{
    AccelerationMode, ConfigId, Device, GnaError, SoftwareModes, InstrumentationConfig, InstrumentationPoint,
    ModelDescription, ModelId, Operand, Operation, RequestState, RuntimeConfig, Status, Tensor,
    TimeUnit,
};

const INPUT: usize = 128;
const OUTPUT: usize = 512;

fn i16s(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i32s(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn read_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// 2x4 affine layer with per-request input and output.
fn affine_model(device: &Device) -> (ModelId, usize) {
    let base = device.allocate_memory(4096).unwrap();
    device.write(base, &i16s(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
    device.write(base + 64, &i32s(&[10, -10])).unwrap();
    let op = Operation::affine(
        Tensor::new(&[1, 4], DataWidth::Int16),
        Tensor::new(&[1, 2], DataWidth::Int32),
        Tensor::new(&[2, 4], DataWidth::Int16).at(base),
        Tensor::new(&[2], DataWidth::Int32).at(base + 64),
    );
    let model = device
        .create_model(&ModelDescription::new(vec![op]))
        .unwrap();
    (model, base)
}

fn bind(device: &Device, model: ModelId, base: usize, input: &[i16]) -> ConfigId {
    device.write(base + INPUT, &i16s(input)).unwrap();
    let config = device.create_request_config(model).unwrap();
    device
        .set_operand_buffer(config, 0, Operand::Input, base + INPUT)
        .unwrap();
    device
        .set_operand_buffer(config, 0, Operand::Output, base + OUTPUT)
        .unwrap();
    config
}

fn simulated(driver: &Arc<SimulatedDriver>, config: RuntimeConfig) -> Device {
    Device::with_driver(
        config,
        Some(Arc::clone(driver) as Arc<dyn DriverInterface>),
    )
    .unwrap()
}

// ── Software ─────────────────────────────────────────────────────────────────

#[test]
fn software_request_scores() {
    let device = Device::open(RuntimeConfig::software()).unwrap();
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);

    let request = device.enqueue(config).unwrap();
    let outcome = device.wait(request, None).unwrap();
    assert_eq!(outcome.status, Status::Success);
    assert!(outcome.profile.is_none());
    assert_eq!(read_i32s(&device.read(base + OUTPUT, 8).unwrap()), vec![20, 16]);
    assert_eq!(device.request_state(request), None);
}

#[test]
fn rebinding_applies_to_later_requests() {
    let device = Device::open(RuntimeConfig::software()).unwrap();
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);
    device.write(base + 256, &i16s(&[0, 0, 0, 1])).unwrap();

    let first = device.enqueue(config).unwrap();
    let outcome = device.wait(first, None).unwrap();
    assert_eq!(outcome.status, Status::Success);

    device
        .set_operand_buffer(config, 0, Operand::Input, base + 256)
        .unwrap();
    let second = device.enqueue(config).unwrap();
    device.wait(second, None).unwrap();
    assert_eq!(read_i32s(&device.read(base + OUTPUT, 8).unwrap()), vec![14, -2]);
}

#[test]
fn profile_reports_requested_points() {
    let device = Device::open(RuntimeConfig::software()).unwrap();
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);
    device
        .set_instrumentation(
            config,
            Some(InstrumentationConfig::new(
                &[
                    InstrumentationPoint::Enqueued,
                    InstrumentationPoint::ExecutionCompleted,
                    InstrumentationPoint::DeviceRequestSent,
                ],
                TimeUnit::Microseconds,
            )),
        )
        .unwrap();

    let request = device.enqueue(config).unwrap();
    let profile = device.wait(request, None).unwrap().profile.unwrap();
    assert_eq!(profile.values.len(), 3);
    assert!(profile.get(InstrumentationPoint::ExecutionCompleted).is_some());
    // software runs never reach the driver
    assert_eq!(profile.get(InstrumentationPoint::DeviceRequestSent), None);
}

#[test]
fn hardware_mode_needs_a_device() {
    let device = Device::open(RuntimeConfig::software()).unwrap();
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);
    device
        .set_acceleration_mode(config, AccelerationMode::Hardware)
        .unwrap();
    let err = device.enqueue(config).unwrap_err();
    assert_eq!(err.status(), Status::ErrorDeviceNotAvailable);
}

#[test]
fn referenced_memory_cannot_be_freed() {
    let device = Device::open(RuntimeConfig::software()).unwrap();
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);

    let err = device.free_memory(base).unwrap_err();
    assert_eq!(err.status(), Status::ErrorMemoryInUse);

    device.release_model(model).unwrap();
    assert!(matches!(
        device.request_config(config),
        Err(GnaError::InvalidIdentifier { .. })
    ));
    device.free_memory(base).unwrap();
}

fn sevens(config: &KernelConfig<'_>, out: &mut [i64]) -> u32 {
    out[..config.shape.vectors * config.output_rows()].fill(7);
    0
}

#[test]
fn registered_kernels_score_software_layers() {
    let mut kernels = KernelTable::new(SoftwareModes::detect());
    let mode = DataMode::new(DataWidth::Int16, DataWidth::Int16, DataWidth::Int32);
    for kernel_mode in kernels.modes().supported() {
        assert!(kernels.register_accelerated(HwOperation::Affine, mode, kernel_mode, false, sevens));
    }
    let device = Device::with_kernels(RuntimeConfig::software(), None, kernels).unwrap();
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);

    let request = device.enqueue(config).unwrap();
    device.wait(request, None).unwrap();
    assert_eq!(read_i32s(&device.read(base + OUTPUT, 8).unwrap()), vec![7, 7]);
}

#[test]
fn thread_count_is_adjustable() {
    let device = Device::open(RuntimeConfig::software().with_threads(2)).unwrap();
    assert_eq!(device.number_of_threads(), 2);
    device.set_number_of_threads(4).unwrap();
    assert_eq!(device.number_of_threads(), 4);
    assert_eq!(
        device.set_number_of_threads(128).unwrap_err().status(),
        Status::ErrorInvalidThreadCount
    );

    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);
    let requests: Vec<_> = (0..8).map(|_| device.enqueue(config).unwrap()).collect();
    for request in requests {
        assert!(device.wait(request, None).unwrap().status.is_success());
    }
}

// ── Simulated device ─────────────────────────────────────────────────────────

#[test]
fn hardware_runs_are_submitted() {
    let driver = Arc::new(SimulatedDriver::new(DeviceVersion::Gna3_0));
    let device = simulated(&driver, RuntimeConfig::software());
    assert_eq!(device.device_version(), Some(DeviceVersion::Gna3_0));

    let (model, base) = affine_model(&device);
    assert!(device.model(model).unwrap().hardware().is_some());
    let config = bind(&device, model, base, &[1, 1, 1, 1]);

    let request = device.enqueue(config).unwrap();
    assert_eq!(device.wait(request, None).unwrap().status, Status::Success);

    let submissions = driver.submissions();
    assert_eq!(submissions.len(), 1);
    assert!(matches!(
        submissions[0].config,
        SubmitConfig::Xnn { layer_count: 1, .. }
    ));
    assert!(!submissions[0].buffers[0].patches.is_empty());
}

#[test]
fn consistent_configuration_stays_on_the_host() {
    let driver = Arc::new(SimulatedDriver::new(DeviceVersion::Gna3_0));
    let device = simulated(&driver, RuntimeConfig::software());
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);
    device
        .enable_hardware_consistency(config, DeviceVersion::Gna2_0)
        .unwrap();

    let request = device.enqueue(config).unwrap();
    assert_eq!(device.wait(request, None).unwrap().status, Status::Success);

    assert!(driver.submissions().is_empty());
    assert_eq!(
        read_i32s(&device.read(base + OUTPUT, 8).unwrap()),
        vec![20, 16]
    );
}

#[test]
fn saturation_and_faults_reach_the_waiter() {
    let driver = Arc::new(SimulatedDriver::new(DeviceVersion::Gna2_0));
    let device = simulated(&driver, RuntimeConfig::software());
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);

    driver.push_status(status::COMPLETED | status::SATURATION);
    let request = device.enqueue(config).unwrap();
    assert_eq!(
        device.wait(request, None).unwrap().status,
        Status::WarningArithmeticSaturation
    );

    driver.push_status(status::COMPLETED | status::MMU_ERROR);
    let request = device.enqueue(config).unwrap();
    let err = device.wait(request, None).unwrap_err();
    assert_eq!(err.status(), Status::ErrorDeviceMmu);
}

#[test]
fn pending_limit_is_enforced() {
    let driver =
        Arc::new(SimulatedDriver::new(DeviceVersion::Gna3_0).with_latency(Duration::from_millis(100)));
    let device = simulated(
        &driver,
        RuntimeConfig::software().with_max_pending_requests(2),
    );
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);

    let first = device.enqueue(config).unwrap();
    let second = device.enqueue(config).unwrap();
    let err = device.enqueue(config).unwrap_err();
    assert!(matches!(err, GnaError::QueueFull { limit: 2 }));

    let err = device.release_request_config(config).unwrap_err();
    assert_eq!(err.status(), Status::ErrorInvalidConfiguration);

    device.wait(first, None).unwrap();
    device.wait(second, None).unwrap();
    device.release_request_config(config).unwrap();
}

#[test]
fn busy_request_can_be_waited_again() {
    let driver =
        Arc::new(SimulatedDriver::new(DeviceVersion::Gna3_0).with_latency(Duration::from_millis(200)));
    let device = simulated(&driver, RuntimeConfig::software().with_threads(1));
    let (model, base) = affine_model(&device);

    let hardware = bind(&device, model, base, &[1, 1, 1, 1]);
    let software = device.create_request_config(model).unwrap();
    device
        .set_operand_buffer(software, 0, Operand::Input, base + INPUT)
        .unwrap();
    device
        .set_operand_buffer(software, 0, Operand::Output, base + OUTPUT + 64)
        .unwrap();
    device
        .set_acceleration_mode(software, AccelerationMode::Software)
        .unwrap();

    let slow = device.enqueue(hardware).unwrap();
    let queued = device.enqueue(software).unwrap();

    let err = device
        .wait(queued, Some(Duration::from_millis(10)))
        .unwrap_err();
    assert_eq!(err.status(), Status::WarningDeviceBusy);
    assert_eq!(device.request_state(queued), Some(RequestState::Busy));

    assert_eq!(device.wait(queued, None).unwrap().status, Status::Success);
    assert_eq!(
        read_i32s(&device.read(base + OUTPUT + 64, 8).unwrap()),
        vec![20, 16]
    );
    device.wait(slow, None).unwrap();
    assert_eq!(driver.submissions().len(), 1);
}

#[test]
fn release_is_refused_while_a_waiter_blocks() {
    let driver =
        Arc::new(SimulatedDriver::new(DeviceVersion::Gna3_0).with_latency(Duration::from_millis(300)));
    let device = simulated(&driver, RuntimeConfig::software());
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);
    let request = device.enqueue(config).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| device.wait(request, None));
        thread::sleep(Duration::from_millis(50));

        let err = device.release_request_config(config).unwrap_err();
        assert_eq!(err.status(), Status::ErrorInvalidConfiguration);
        let err = device.release_model(model).unwrap_err();
        assert_eq!(err.status(), Status::ErrorInvalidConfiguration);

        assert_eq!(waiter.join().unwrap().unwrap().status, Status::Success);
    });

    device.release_request_config(config).unwrap();
    device.release_model(model).unwrap();
}

#[test]
fn waited_requests_count_against_the_limit() {
    let driver =
        Arc::new(SimulatedDriver::new(DeviceVersion::Gna3_0).with_latency(Duration::from_millis(300)));
    let device = simulated(
        &driver,
        RuntimeConfig::software()
            .with_threads(1)
            .with_max_pending_requests(1),
    );
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);
    let first = device.enqueue(config).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| device.wait(first, None));
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            device.enqueue(config),
            Err(GnaError::QueueFull { limit: 1 })
        ));
        assert_eq!(waiter.join().unwrap().unwrap().status, Status::Success);
    });

    let next = device.enqueue(config).unwrap();
    device.wait(next, None).unwrap();
    assert_eq!(driver.submissions().len(), 2);
}

#[test]
fn busy_device_is_retried() {
    let driver = Arc::new(SimulatedDriver::new(DeviceVersion::Gna3_0));
    let device = simulated(&driver, RuntimeConfig::software());
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);

    driver.refuse_next(3);
    let request = device.enqueue(config).unwrap();
    assert_eq!(device.wait(request, None).unwrap().status, Status::Success);
    assert_eq!(driver.submissions().len(), 1);
}

#[test]
fn device_busy_past_recovery_fails_the_request() {
    let driver = Arc::new(
        SimulatedDriver::new(DeviceVersion::Gna3_0).with_recovery_timeout_ms(20),
    );
    let device = simulated(&driver, RuntimeConfig::software());
    let (model, base) = affine_model(&device);
    let config = bind(&device, model, base, &[1, 1, 1, 1]);

    driver.refuse_next(100_000);
    let request = device.enqueue(config).unwrap();
    let err = device.wait(request, None).unwrap_err();
    assert_eq!(err.status(), Status::ErrorDeviceCriticalFailure);
    assert!(matches!(
        device.wait(request, None),
        Err(GnaError::InvalidIdentifier { .. })
    ));
    assert!(driver.submissions().is_empty());
}

#[test]
fn rebinding_releases_the_old_buffer() {
    let driver = Arc::new(SimulatedDriver::new(DeviceVersion::Gna2_0));
    let device = simulated(&driver, RuntimeConfig::software());
    let (model, base) = affine_model(&device);
    let scratch = device.allocate_memory(4096).unwrap();

    device.write(base + INPUT, &i16s(&[1, 1, 1, 1])).unwrap();
    let config = device.create_request_config(model).unwrap();
    device
        .set_operand_buffer(config, 0, Operand::Input, base + INPUT)
        .unwrap();
    device
        .set_operand_buffer(config, 0, Operand::Output, scratch)
        .unwrap();
    let request = device.enqueue(config).unwrap();
    device.wait(request, None).unwrap();

    let err = device.free_memory(scratch).unwrap_err();
    assert_eq!(err.status(), Status::ErrorMemoryInUse);

    device
        .set_operand_buffer(config, 0, Operand::Output, base + OUTPUT)
        .unwrap();
    device.free_memory(scratch).unwrap();
    assert_eq!(driver.mapped_count(), 2);
}

#[test]
fn dropping_the_device_unmaps_everything() {
    let driver = Arc::new(SimulatedDriver::new(DeviceVersion::Gna2_0));
    {
        let device = simulated(&driver, RuntimeConfig::software());
        let (model, base) = affine_model(&device);
        let config = bind(&device, model, base, &[1, 1, 1, 1]);
        let request = device.enqueue(config).unwrap();
        device.wait(request, None).unwrap();
        // allocation plus descriptor memory
        assert_eq!(driver.mapped_count(), 2);
    }
    assert_eq!(driver.mapped_count(), 0);
}
