//! `gna`: command-line interface for the GNA scoring accelerator.
//!
//! ```text
//! USAGE:
//!   gna enumerate                      List device nodes and generations
//!   gna info <index>                   Open one device and print its parameters
//!   gna cpu                            Software kernel modes of this host
//!   gna plan [--generation <name>]     Partition a sample model per generation
//!   gna export -g <name> -o <file>     Export the sample model for a generation
//!   gna score [--requests <n>]         Score the sample model (GNA_* selects the driver)
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use gna_chip::{DataWidth, DeviceVersion, HardwareCapabilities};
use gna_driver::{DeviceManager, DriverInterface};
use gna_runtime::{
    CapabilityTable, CpuFeatures, Device, InstrumentationConfig, InstrumentationPoint,
    ModelDescription, ModelId, Operation, RuntimeConfig, SoftwareModes, SubModelKind,
    Tensor, TimeUnit,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gna", about = "GNA scoring accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List GNA device nodes and their generations.
    Enumerate,
    /// Open one device and print the parameters its driver reports.
    Info {
        /// Device node index (e.g. 0 for /dev/gna0).
        index: usize,
    },
    /// Print the CPU features and software kernel modes of this host.
    Cpu,
    /// Show how the sample model is split between device and host.
    Plan {
        /// Generation name (e.g. 2.0, 3.0e). Every generation if omitted.
        #[arg(short, long)]
        generation: Option<String>,
    },
    /// Export the sample model's descriptors and memory for a generation.
    Export {
        /// Generation name (e.g. 3.0).
        #[arg(short, long)]
        generation: String,
        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Score the sample model and report latency.
    Score {
        /// Number of requests to run.
        #[arg(short, long, default_value_t = 16)]
        requests: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Info { index } => cmd_info(index)?,
        Cmd::Cpu => cmd_cpu(),
        Cmd::Plan { generation } => cmd_plan(generation.as_deref())?,
        Cmd::Export { generation, output } => cmd_export(&generation, &output)?,
        Cmd::Score { requests } => cmd_score(requests)?,
    }

    Ok(())
}

fn parse_generation(name: &str) -> Result<DeviceVersion> {
    DeviceVersion::from_name(name).ok_or_else(|| {
        anyhow!("Unknown generation '{name}' (expected 0.9, 1.0, 2.0, 3.0, 3.5, 1.0e, 3.0e, 3.1e)")
    })
}

// ── Sample model ─────────────────────────────────────────────────────────────

/// Affine (16-bit input), affine (8-bit input), GMM: one layer each that
/// every generation family treats differently.
fn sample_model(device: &Device) -> Result<(ModelId, usize)> {
    let base = device.allocate_memory(16 * 1024)?;
    let weights: Vec<u8> = (0..64i16).flat_map(|i| ((i % 5) - 2).to_le_bytes()).collect();
    device.write(base, &weights)?;

    let affine = |input: DataWidth, at: usize| {
        Operation::affine(
            Tensor::new(&[1, 8], input).at(base + at),
            Tensor::new(&[1, 8], DataWidth::Int32).at(base + at + 512),
            Tensor::new(&[8, 8], DataWidth::Int16).at(base),
            Tensor::new(&[8], DataWidth::Int32).at(base + 256),
        )
    };
    let gmm = Operation::gmm(
        Tensor::new(&[1, 8], DataWidth::Int8).at(base + 8192),
        Tensor::new(&[1, 2], DataWidth::Int32).at(base + 8192 + 512),
        Tensor::new(&[2, 1, 8], DataWidth::Int8).at(base + 4096),
        Tensor::new(&[2, 1, 8], DataWidth::Int8).at(base + 4096 + 256),
        Tensor::new(&[2, 1], DataWidth::Int32).at(base + 4096 + 512),
    );
    let model = device.create_model(&ModelDescription::new(vec![
        affine(DataWidth::Int16, 1024),
        affine(DataWidth::Int8, 2048),
        gmm,
    ]))?;
    Ok((model, base))
}

fn kind_label(kind: SubModelKind) -> &'static str {
    match kind {
        SubModelKind::Software => "host",
        SubModelKind::Hardware => "device",
        SubModelKind::GmmHardware => "device (GMM)",
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn cmd_enumerate() -> Result<()> {
    let mgr = DeviceManager::discover()?;

    println!("GNA devices: {}", mgr.device_count());
    println!();

    for info in mgr.devices() {
        let version = info
            .version
            .map_or_else(|| "unknown generation".to_string(), |v| v.to_string());
        println!(
            "[{}] {} @ {}",
            info.index,
            version,
            info.pcie_address.as_deref().unwrap_or("?")
        );
        println!("     Node  {}", info.path.display());
        if let Some(id) = info.device_id {
            println!("     PCI   device id {id:#06x}");
        }
        if let Some(v) = info.version {
            let caps = HardwareCapabilities::for_version(v);
            println!(
                "     Layers {} per run   Input buffer {} KiB",
                caps.max_layer_count, caps.input_buffer_kb
            );
        }
        println!();
    }

    Ok(())
}

fn cmd_info(index: usize) -> Result<()> {
    let mgr = DeviceManager::discover()?;
    let info = mgr.device(index)?.clone();
    let driver = mgr
        .open(index)
        .with_context(|| format!("opening {}", info.path.display()))?;
    let caps = driver.capabilities();

    println!("Device        : {}", info.path.display());
    println!("PCIe address  : {}", info.pcie_address.as_deref().unwrap_or("?"));
    println!("Generation    : {}", caps.device_version);
    println!("Driver        : {}", driver.driver_type());
    println!("Input buffer  : {} KiB", caps.buffer_size_kb);
    println!("Recovery      : {} ms", caps.recovery_timeout_ms);
    println!("Submit timeout: {:?}", caps.submit_timeout());
    println!(
        "Max layers    : {}",
        HardwareCapabilities::for_version(caps.device_version).max_layer_count
    );

    Ok(())
}

fn cmd_cpu() {
    let features = CpuFeatures::detect();
    let modes = SoftwareModes::from_features(features);
    println!("SSE4.2        : {}", features.sse4_2);
    println!("AVX           : {}", features.avx);
    println!("AVX2          : {}", features.avx2);
    println!("Wide registers: {}", features.os_wide_registers);
    let supported: Vec<String> = modes.supported().iter().map(ToString::to_string).collect();
    println!("Kernel modes  : {}", supported.join(", "));
    println!("Fastest       : {}", modes.fastest());
}

fn cmd_plan(generation: Option<&str>) -> Result<()> {
    let versions = match generation {
        Some(name) => vec![parse_generation(name)?],
        None => DeviceVersion::ALL.to_vec(),
    };
    let device = Device::open(RuntimeConfig::software())?;
    let (model, _) = sample_model(&device)?;
    let compiled = device.model(model)?;

    println!("Sample model: affine (i16 input), affine (i8 input), GMM");
    println!();
    for version in versions {
        let runs = compiled.partition(&CapabilityTable::hardware(version));
        let plan: Vec<String> = runs
            .iter()
            .map(|r| format!("{} {:?}", kind_label(r.kind), r.layers()))
            .collect();
        println!("{version:<18} {}", plan.join("  |  "));
    }

    Ok(())
}

fn cmd_export(generation: &str, output: &Path) -> Result<()> {
    let version = parse_generation(generation)?;
    let device = Device::open(RuntimeConfig::software())?;
    let (model, _) = sample_model(&device)?;
    let export = device.export_model(model, version)?;

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let written = export.write_to(BufWriter::new(file))?;
    println!(
        "Exported {} layers for {version}: {} descriptor bytes, {} regions, {written} bytes -> {}",
        export.layer_count(),
        export.descriptors().len(),
        export.regions().len(),
        output.display()
    );
    Ok(())
}

fn cmd_score(requests: usize) -> Result<()> {
    let device = Device::open(RuntimeConfig::from_env()?)?;
    match device.device_version() {
        Some(v) => println!(
            "Device: {v} ({})",
            device
                .driver_type()
                .map_or_else(|| "?".to_string(), |t| t.to_string())
        ),
        None => println!("Device: none, scoring in software"),
    }

    let (model, base) = sample_model(&device)?;
    let input: Vec<u8> = (0..8i16).flat_map(|i| (i * 3).to_le_bytes()).collect();
    device.write(base + 1024, &input)?;

    let config = device.create_request_config(model)?;
    device.set_instrumentation(
        config,
        Some(InstrumentationConfig::new(
            &[
                InstrumentationPoint::ExecutionStarted,
                InstrumentationPoint::ExecutionCompleted,
            ],
            TimeUnit::Microseconds,
        )),
    )?;

    let start = Instant::now();
    let mut busy_us = 0u64;
    for _ in 0..requests {
        let request = device.enqueue(config)?;
        let outcome = device.wait(request, None)?;
        if let Some(profile) = &outcome.profile {
            busy_us += profile
                .between(
                    InstrumentationPoint::ExecutionStarted,
                    InstrumentationPoint::ExecutionCompleted,
                )
                .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX));
        }
        if !outcome.status.is_success() {
            return Err(anyhow!("request failed: {}", outcome.status));
        }
    }
    let elapsed = start.elapsed();

    let scores = device.read(base + 1024 + 512, 32)?;
    let first: Vec<i32> = scores
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    println!("Requests      : {requests}");
    println!("Wall time     : {elapsed:?}");
    if requests > 0 {
        println!("Execution avg : {} µs", busy_us / requests as u64);
    }
    println!("Layer 0 scores: {first:?}");
    Ok(())
}
