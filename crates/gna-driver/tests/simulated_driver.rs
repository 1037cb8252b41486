//! Simulated backend behaviour
//!
//! Exercises the driver contract end to end without hardware.

use std::time::{Duration, Instant};

use gna_chip::{status, DeviceVersion};
use gna_driver::protocol::{
    BufferEntry, ControlFlags, MemoryPatch, PatchValue, SubmitConfig, Submission,
};
use gna_driver::{
    select_driver, Completion, DriverError, DriverInterface, DriverSelection, DriverType,
    HardwareFault, HostBuffer, MemoryId, SimulatedDriver,
};

fn buffer(size: u64) -> HostBuffer {
    HostBuffer {
        address: 0x1000,
        size,
    }
}

fn xnn_submission(id: MemoryId, size: u64) -> Submission {
    Submission {
        flags: ControlFlags::default(),
        config: SubmitConfig::Xnn {
            layer_base: 0,
            layer_count: 1,
        },
        buffers: vec![BufferEntry {
            memory_id: id,
            offset: 0,
            size,
            patches: vec![MemoryPatch::new(0x20, PatchValue::U32(0x2000))],
        }],
    }
}

#[test]
fn map_submit_unmap() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna2_0);
    let id = driver.map_memory(buffer(4096)).unwrap();
    assert_eq!(driver.mapped_size(id), Some(4096));

    let result = driver.submit(&xnn_submission(id, 4096).encode()).unwrap();
    assert_eq!(result.completion, Completion::Success);
    assert!(result.driver_perf.ioctl_return >= result.driver_perf.ioctl_submit);
    assert_eq!(driver.submissions().len(), 1);

    driver.unmap_memory(id).unwrap();
    assert_eq!(driver.mapped_count(), 0);
    assert!(matches!(
        driver.unmap_memory(id),
        Err(DriverError::UnknownMemoryId { .. })
    ));
}

#[test]
fn map_blocks_until_confirmed() {
    let driver =
        SimulatedDriver::new(DeviceVersion::Gna3_0).with_map_ack_delay(Duration::from_millis(30));
    let started = Instant::now();
    let id = driver.map_memory(buffer(4096)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(30));
    driver.unmap_memory(id).unwrap();
}

#[test]
fn map_confirmation_timeout() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna3_0)
        .with_recovery_timeout_ms(10)
        .with_map_ack_delay(Duration::from_millis(500));
    assert!(matches!(
        driver.map_memory(buffer(4096)),
        Err(DriverError::MapFailed { .. })
    ));
}

#[test]
fn forbidden_id_is_rejected() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna2_0).with_forbidden_id();
    assert!(matches!(
        driver.map_memory(buffer(4096)),
        Err(DriverError::ForbiddenMemoryId)
    ));
    assert_eq!(driver.reserved_releases(), 1);
    assert_eq!(driver.mapped_count(), 0);
    assert!(driver.map_memory(buffer(4096)).is_ok());
    assert_eq!(driver.mapped_count(), 1);
}

#[test]
fn refused_submissions_report_busy() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna2_0);
    let id = driver.map_memory(buffer(4096)).unwrap();
    let payload = xnn_submission(id, 4096).encode();
    driver.refuse_next(1);
    assert!(matches!(driver.submit(&payload), Err(DriverError::Busy)));
    assert!(driver.submit(&payload).is_ok());
    assert_eq!(driver.submissions().len(), 1);
}

#[test]
fn saturation_is_a_warning() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna2_0);
    let id = driver.map_memory(buffer(4096)).unwrap();
    driver.push_status(status::COMPLETED | status::SATURATION);
    let result = driver.submit(&xnn_submission(id, 4096).encode()).unwrap();
    assert_eq!(result.completion, Completion::Saturated);
}

#[test]
fn hardware_faults_are_errors() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna2_0);
    let id = driver.map_memory(buffer(4096)).unwrap();
    driver.push_status(status::COMPLETED | status::MMU_ERROR);
    let err = driver
        .submit(&xnn_submission(id, 4096).encode())
        .unwrap_err();
    assert!(matches!(
        err,
        DriverError::Hardware {
            fault: HardwareFault::MmuError,
            ..
        }
    ));
}

#[test]
fn unmapped_buffer_is_rejected() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna2_0);
    let err = driver
        .submit(&xnn_submission(MemoryId::new(42), 4096).encode())
        .unwrap_err();
    assert!(matches!(err, DriverError::UnknownMemoryId { id: 42 }));
}

#[test]
fn window_beyond_mapping_is_rejected() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna2_0);
    let id = driver.map_memory(buffer(4096)).unwrap();
    let err = driver
        .submit(&xnn_submission(id, 8192).encode())
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidPayload { .. }));
}

#[test]
fn malformed_payload_is_rejected() {
    let driver = SimulatedDriver::new(DeviceVersion::Gna2_0);
    assert!(matches!(
        driver.submit(&[0u8; 12]),
        Err(DriverError::InvalidPayload { .. })
    ));
}

#[test]
fn select_simulated() {
    let driver = select_driver(DriverSelection::Simulated(DeviceVersion::Gna3_5), 0).unwrap();
    assert_eq!(driver.driver_type(), DriverType::Simulated);
    assert_eq!(driver.capabilities().device_version, DeviceVersion::Gna3_5);
}
