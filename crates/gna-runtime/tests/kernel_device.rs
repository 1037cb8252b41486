//! Runtime against a real `/dev/gna0`
//!
//! Scores the same layer on the device and in software and compares.

use gna_chip::DataWidth;
use gna_driver::DriverSelection;
use gna_runtime::{
    AccelerationMode, Device, ModelDescription, Operand, Operation, RuntimeConfig, Status, Tensor,
};

fn i16s(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
#[ignore] // Requires hardware
fn test_device_matches_software() {
    let config = RuntimeConfig::default().with_driver(Some(DriverSelection::Kernel));
    let device = Device::open(config).expect("open device");
    println!("Device: {:?}", device.device_version());

    let base = device.allocate_memory(8192).expect("allocate");
    let weights: Vec<i16> = (0..64).map(|i| (i % 7) - 3).collect();
    device.write(base, &i16s(&weights)).expect("weights");
    device.write(base + 256, &[0u8; 32]).expect("biases");
    let input: Vec<i16> = (0..16).map(|i| i * 11 - 80).collect();
    device.write(base + 512, &i16s(&input)).expect("input");

    let op = Operation::affine(
        Tensor::new(&[1, 16], DataWidth::Int16),
        Tensor::new(&[1, 4], DataWidth::Int32),
        Tensor::new(&[4, 16], DataWidth::Int16).at(base),
        Tensor::new(&[4], DataWidth::Int32).at(base + 256),
    );
    let model = device
        .create_model(&ModelDescription::new(vec![op]))
        .expect("model");

    let mut outputs = Vec::new();
    for (mode, output) in [
        (AccelerationMode::Hardware, base + 4096),
        (AccelerationMode::Software, base + 6144),
    ] {
        let config = device.create_request_config(model).expect("config");
        device
            .set_operand_buffer(config, 0, Operand::Input, base + 512)
            .expect("input");
        device
            .set_operand_buffer(config, 0, Operand::Output, output)
            .expect("output");
        device.set_acceleration_mode(config, mode).expect("mode");
        let request = device.enqueue(config).expect("enqueue");
        let outcome = device.wait(request, None).expect("wait");
        assert_eq!(outcome.status, Status::Success, "{mode}");
        outputs.push(device.read(output, 16).expect("read"));
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
#[ignore] // Requires hardware
fn test_auto_selects_the_device() {
    let device = Device::open(RuntimeConfig::default()).expect("open device");
    assert!(device.device_version().is_some());
    assert!(device.driver_type().is_some());
}
