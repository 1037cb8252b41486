//! Top-level runtime object
//!
//! A [`Device`] owns everything a caller creates: host memory, compiled
//! models, request configurations, pending requests and the worker pool.
//! Callers hold plain ids; the device resolves them on every call, so
//! releasing a model can never leave a dangling reference behind.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gna_chip::DeviceVersion;
use gna_driver::{select_driver, DriverInterface, DriverSelection, DriverType};
use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::cpu::{AccelerationMode, ExecutionPolicy, HardwareUse, SoftwareModes};
use crate::error::{GnaError, Result, Status};
use crate::export::ExportedModel;
use crate::hardware_model::HardwareTarget;
use crate::kernels::KernelTable;
use crate::memory::{HostMemory, MemoryArena};
use crate::model::{CompiledModel, Layer, ModelDescription, ModelId, Operand};
use crate::partition::{CapabilityTable, SubModel, SubModelKind};
use crate::pool::{ThreadPool, WorkerBuffers};
use crate::profiler::{InstrumentationConfig, InstrumentationPoint, RequestProfiler};
use crate::request::{
    Completion, ConfigId, Execution, RequestConfiguration, RequestHandler, RequestId,
    RequestOutcome, RequestState,
};
use crate::software;

/// Generation software execution emulates when no device is open.
pub const DEFAULT_EMULATED_VERSION: DeviceVersion = DeviceVersion::Gna3_0;

/// Host runtime for one accelerator, or for software-only scoring.
#[derive(Debug)]
pub struct Device {
    config: RuntimeConfig,
    driver: Option<Arc<dyn DriverInterface>>,
    kernels: Arc<KernelTable>,
    memory: RwLock<MemoryArena>,
    models: RwLock<HashMap<ModelId, Arc<CompiledModel>>>,
    configs: RwLock<HashMap<ConfigId, Arc<RequestConfiguration>>>,
    handler: RequestHandler,
    pool: Mutex<ThreadPool>,
    next_model: AtomicU32,
    next_config: AtomicU32,
}

impl Device {
    /// Open the driver `config` selects and start the worker pool.
    ///
    /// With `DriverSelection::Auto`, a missing device is not an error: the
    /// runtime falls back to software execution.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration, an explicitly
    /// selected driver that cannot be opened, or a pool that cannot start.
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let driver: Option<Arc<dyn DriverInterface>> = match config.driver {
            None => None,
            Some(DriverSelection::Auto) => match select_driver(DriverSelection::Auto, config.device_index) {
                Ok(driver) => Some(Arc::from(driver)),
                Err(e) => {
                    tracing::warn!("No accelerator available ({e}), scoring in software");
                    None
                }
            },
            Some(selection) => Some(Arc::from(select_driver(selection, config.device_index)?)),
        };
        Self::with_driver(config, driver)
    }

    /// Build a device around an already opened driver.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or a pool that cannot
    /// start.
    pub fn with_driver(
        config: RuntimeConfig,
        driver: Option<Arc<dyn DriverInterface>>,
    ) -> Result<Self> {
        Self::with_kernels(config, driver, KernelTable::new(SoftwareModes::detect()))
    }

    /// Build a device around an opened driver and a kernel table with
    /// accelerated kernels already registered. The table is frozen from
    /// here on.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or a pool that cannot
    /// start.
    pub fn with_kernels(
        config: RuntimeConfig,
        driver: Option<Arc<dyn DriverInterface>>,
        kernels: KernelTable,
    ) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPool::new(config.threads, config.max_pending_requests)?;
        match &driver {
            Some(driver) => {
                let caps = driver.capabilities();
                tracing::info!(
                    "Opened {} device via {} driver: {} KiB input buffer, recovery timeout {} ms",
                    caps.device_version,
                    driver.driver_type(),
                    caps.buffer_size_kb,
                    caps.recovery_timeout_ms
                );
            }
            None => tracing::info!(
                "Software-only runtime, kernel modes {:?}",
                kernels.modes().supported()
            ),
        }
        Ok(Self {
            handler: RequestHandler::new(config.max_pending_requests),
            kernels: Arc::new(kernels),
            config,
            driver,
            memory: RwLock::new(MemoryArena::new()),
            models: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            pool: Mutex::new(pool),
            next_model: AtomicU32::new(1),
            next_config: AtomicU32::new(1),
        })
    }

    /// Configuration the device was opened with.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Generation of the open device.
    #[must_use]
    pub fn device_version(&self) -> Option<DeviceVersion> {
        self.driver.as_ref().map(|d| d.capabilities().device_version)
    }

    /// Backend of the open device.
    #[must_use]
    pub fn driver_type(&self) -> Option<DriverType> {
        self.driver.as_ref().map(|d| d.driver_type())
    }

    // ── Memory ───────────────────────────────────────────────────────────────

    /// Allocate page-aligned host memory and map it for the device.
    /// Returns the address of the first byte.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::ResourceExhausted` for a zero size or a failed
    /// allocation and driver errors if mapping fails.
    pub fn allocate_memory(&self, size: usize) -> Result<usize> {
        let mut arena = self.memory.write();
        let memory = arena.allocate(size)?;
        if let Some(driver) = &self.driver {
            if let Err(e) = map(driver.as_ref(), &memory) {
                let address = memory.address();
                drop(memory);
                arena.free(address)?;
                return Err(e);
            }
        }
        tracing::debug!("Allocated {} bytes at {:#x}", memory.capacity(), memory.address());
        Ok(memory.address())
    }

    /// Unmap and release an allocation.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown addresses and
    /// `GnaError::MemoryInUse` while a model, configuration or request
    /// still references it.
    pub fn free_memory(&self, address: usize) -> Result<()> {
        let memory = self.memory.write().free(address)?;
        unmap(self.driver.as_deref(), &memory);
        tracing::debug!("Freed memory at {address:#x}");
        Ok(())
    }

    /// Copy `data` to `address`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::MemoryOutOfBounds` if the range leaves every
    /// allocation.
    pub fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        self.memory.read().resolve(address, data.len())?.write(data)
    }

    /// Copy `len` bytes from `address`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::MemoryOutOfBounds` if the range leaves every
    /// allocation.
    pub fn read(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        self.memory.read().resolve(address, len)?.read_into(&mut out)?;
        Ok(out)
    }

    // ── Models ───────────────────────────────────────────────────────────────

    /// Validate and compile a model. With a device open, descriptors are
    /// built for it and mapped.
    ///
    /// # Errors
    ///
    /// Returns the first layer error, `GnaError::ResourceExhausted` when
    /// ids run out, and driver errors if the descriptors cannot be mapped.
    pub fn create_model(&self, description: &ModelDescription) -> Result<ModelId> {
        let id = ModelId(next_id(&self.next_model, "model")?);
        let target = self
            .driver
            .as_ref()
            .map(|d| HardwareTarget::from_capabilities(d.capabilities()));
        let model = CompiledModel::compile(
            id,
            description,
            &self.memory.read(),
            &self.kernels,
            target,
        )?;
        if let (Some(driver), Some(hardware)) = (&self.driver, model.hardware()) {
            map(driver.as_ref(), hardware.descriptor_memory())?;
        }
        self.models.write().insert(id, Arc::new(model));
        Ok(id)
    }

    /// Compiled model behind an id.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown ids.
    pub fn model(&self, id: ModelId) -> Result<Arc<CompiledModel>> {
        self.models
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| GnaError::invalid_identifier("model", id.0))
    }

    /// Release a model and every request configuration created for it.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown ids and
    /// `GnaError::InvalidConfiguration` while requests of the model are
    /// pending.
    pub fn release_model(&self, id: ModelId) -> Result<()> {
        let mut configs = self.configs.write();
        let owned: Vec<ConfigId> = configs
            .values()
            .filter(|c| c.model() == id)
            .map(|c| c.id())
            .collect();
        if owned.iter().any(|&c| self.handler.has_pending(c)) {
            return Err(GnaError::invalid_configuration(format!(
                "{id} has pending requests"
            )));
        }
        let model = self
            .models
            .write()
            .remove(&id)
            .ok_or_else(|| GnaError::invalid_identifier("model", id.0))?;
        for config in &owned {
            configs.remove(config);
        }
        drop(configs);
        if let Some(hardware) = model.hardware() {
            unmap(self.driver.as_deref(), hardware.descriptor_memory());
        }
        tracing::info!("Released {id} and {} request configurations", owned.len());
        Ok(())
    }

    /// Describe `model` for a generation that need not be present.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown ids and
    /// `GnaError::UnsupportedOperation` if no layer runs on `version`.
    pub fn export_model(&self, model: ModelId, version: DeviceVersion) -> Result<ExportedModel> {
        ExportedModel::build(&*self.model(model)?, HardwareTarget::for_version(version))
    }

    // ── Request configurations ───────────────────────────────────────────────

    /// New configuration for `model` with the `Auto` acceleration mode.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown models.
    pub fn create_request_config(&self, model: ModelId) -> Result<ConfigId> {
        self.model(model)?;
        let policy = self.kernels.modes().resolve(AccelerationMode::Auto)?;
        let id = ConfigId(next_id(&self.next_config, "request configuration")?);
        self.configs
            .write()
            .insert(id, Arc::new(RequestConfiguration::new(id, model, policy)));
        tracing::debug!("Created {id} for {model}");
        Ok(id)
    }

    /// Snapshot of a configuration.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown ids.
    pub fn request_config(&self, id: ConfigId) -> Result<Arc<RequestConfiguration>> {
        self.configs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| GnaError::invalid_identifier("request configuration", id.0))
    }

    /// Release a configuration.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown ids and
    /// `GnaError::InvalidConfiguration` while requests using it are pending.
    pub fn release_request_config(&self, id: ConfigId) -> Result<()> {
        let mut configs = self.configs.write();
        if self.handler.has_pending(id) {
            return Err(GnaError::invalid_configuration(format!(
                "{id} has pending requests"
            )));
        }
        let config = configs
            .remove(&id)
            .ok_or_else(|| GnaError::invalid_identifier("request configuration", id.0))?;
        drop(configs);
        if let Some(hardware) = self
            .models
            .read()
            .get(&config.model())
            .and_then(|m| m.hardware())
        {
            hardware.invalidate_request(id);
        }
        tracing::debug!("Released {id}");
        Ok(())
    }

    /// Apply `update` to a configuration. Requests already enqueued keep
    /// the snapshot they were created with; the cached hardware request is
    /// dropped so it stops holding buffers the configuration let go of.
    fn update_config(
        &self,
        id: ConfigId,
        update: impl FnOnce(&mut RequestConfiguration, &CompiledModel) -> Result<()>,
    ) -> Result<()> {
        let mut configs = self.configs.write();
        let config = configs
            .get_mut(&id)
            .ok_or_else(|| GnaError::invalid_identifier("request configuration", id.0))?;
        let model = self.model(config.model())?;
        update(Arc::make_mut(config), &model)?;
        if let Some(hardware) = model.hardware() {
            hardware.invalidate_request(id);
        }
        Ok(())
    }

    /// Bind the input or output of one layer to memory at `address`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown ids or layers,
    /// `GnaError::InvalidConfiguration` for parameter operands and
    /// `GnaError::MemoryOutOfBounds` for ranges outside known memory.
    pub fn set_operand_buffer(
        &self,
        config: ConfigId,
        layer: usize,
        operand: Operand,
        address: usize,
    ) -> Result<()> {
        self.update_config(config, |config, model| {
            let layer = layer_of(model, layer)?;
            let len = match operand {
                Operand::Input => layer.input.len,
                Operand::Output => layer.output.len,
                other => {
                    return Err(GnaError::invalid_configuration(format!(
                        "{other:?} buffers are fixed in the model"
                    )))
                }
            };
            let buffer = self.memory.read().resolve(address, len)?;
            config.set_buffer(layer, operand, buffer)
        })
    }

    /// Restrict one layer to the `count` output indices at `address`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::UnsupportedOperation` for layers without active
    /// list support and `GnaError::InvalidConfiguration` for a bad count.
    pub fn enable_active_list(
        &self,
        config: ConfigId,
        layer: usize,
        address: usize,
        count: usize,
    ) -> Result<()> {
        self.update_config(config, |config, model| {
            let layer = layer_of(model, layer)?;
            let buffer = self.memory.read().resolve(address, count * 4)?;
            config.set_active_list(layer, buffer, count)
        })
    }

    /// Choose where and how requests of a configuration execute.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::AccelerationModeNotSupported` for kernel modes
    /// this host lacks.
    pub fn set_acceleration_mode(&self, config: ConfigId, mode: AccelerationMode) -> Result<()> {
        let policy = self.kernels.modes().resolve(mode)?;
        self.update_config(config, |config, _| {
            config.set_policy(policy);
            Ok(())
        })
    }

    /// Score in software with results matching `version` bit for bit.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown configurations.
    pub fn enable_hardware_consistency(&self, config: ConfigId, version: DeviceVersion) -> Result<()> {
        let policy = ExecutionPolicy::consistent_software(self.kernels.modes().fastest());
        self.update_config(config, |config, _| {
            config.set_consistency(version, policy);
            Ok(())
        })
    }

    /// Attach instrumentation to a configuration, or detach it with `None`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidIdentifier` for unknown configurations.
    pub fn set_instrumentation(
        &self,
        config: ConfigId,
        instrumentation: Option<InstrumentationConfig>,
    ) -> Result<()> {
        self.update_config(config, |config, _| {
            config.set_instrumentation(instrumentation);
            Ok(())
        })
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Capabilities a request of `config` partitions against.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::DeviceNotAvailable` when hardware is required and
    /// no device is open.
    pub fn capability_table(&self, config: &RequestConfiguration) -> Result<CapabilityTable> {
        if let Some(version) = config.consistency() {
            return Ok(CapabilityTable::software(version));
        }
        let device = self.device_version();
        match (config.policy().hardware, device) {
            (HardwareUse::Never, _) => Ok(CapabilityTable::software(
                device.unwrap_or(DEFAULT_EMULATED_VERSION),
            )),
            (HardwareUse::Required, None) => Err(GnaError::DeviceNotAvailable),
            (_, Some(version)) => Ok(CapabilityTable::hardware(version)),
            (HardwareUse::IfAvailable, None) => {
                Ok(CapabilityTable::software(DEFAULT_EMULATED_VERSION))
            }
        }
    }

    /// Queue one request of `config`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::QueueFull` at the pending limit,
    /// `GnaError::DeviceNotAvailable` when hardware is required but absent
    /// and `GnaError::InvalidIdentifier` for unknown configurations.
    pub fn enqueue(&self, config: ConfigId) -> Result<RequestId> {
        let profiler = RequestProfiler::start();
        // held until the request is recorded so a release cannot slip in
        let configs = self.configs.read();
        let config = configs
            .get(&config)
            .cloned()
            .ok_or_else(|| GnaError::invalid_identifier("request configuration", config.0))?;
        let model = self.model(config.model())?;
        let runs = model.partition(&self.capability_table(&config)?);
        let job = Job {
            model,
            config: Arc::clone(&config),
            runs,
            kernels: Arc::clone(&self.kernels),
            driver: self.driver.clone(),
        };
        let id = self.handler.enqueue(
            config.id(),
            config.instrumentation().cloned(),
            |completion| {
                self.pool
                    .lock()
                    .execute(Box::new(move |buffers: &mut WorkerBuffers| {
                        job.execute(completion, profiler, buffers);
                    }))
            },
        );
        drop(configs);
        id
    }

    /// Wait for a request. `None` waits without a limit.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::Busy` when the timeout expires first; the request
    /// can be waited on again. Execution errors consume the request.
    pub fn wait(&self, request: RequestId, timeout: Option<Duration>) -> Result<RequestOutcome> {
        self.handler.wait(request, timeout)
    }

    /// State of a pending request.
    #[must_use]
    pub fn request_state(&self, request: RequestId) -> Option<RequestState> {
        self.handler.state(request)
    }

    /// Resize the worker pool. Queued requests finish first.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidThreadCount` outside `1..=127`.
    pub fn set_number_of_threads(&self, threads: usize) -> Result<()> {
        self.pool.lock().set_thread_count(threads)
    }

    /// Current worker count.
    #[must_use]
    pub fn number_of_threads(&self) -> usize {
        self.pool.lock().thread_count()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.pool.get_mut().shutdown();
        let Some(driver) = self.driver.as_deref() else {
            return;
        };
        for model in self.models.get_mut().values() {
            if let Some(hardware) = model.hardware() {
                unmap(Some(driver), hardware.descriptor_memory());
            }
        }
        for memory in self.memory.get_mut().iter() {
            unmap(Some(driver), memory);
        }
    }
}

/// Everything a worker needs to run one request.
struct Job {
    model: Arc<CompiledModel>,
    config: Arc<RequestConfiguration>,
    runs: Arc<[SubModel]>,
    kernels: Arc<KernelTable>,
    driver: Option<Arc<dyn DriverInterface>>,
}

impl Job {
    fn execute(self, completion: Completion, mut profiler: RequestProfiler, buffers: &mut WorkerBuffers) {
        completion.executing();
        profiler.stamp(InstrumentationPoint::ExecutionStarted);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(buffers, &mut profiler)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::warn!("{} panicked: {message}", completion.id());
                Err(GnaError::ExecutionPanicked { message })
            });
        profiler.stamp(InstrumentationPoint::ExecutionCompleted);
        // buffers of the snapshot are released before the waiter wakes
        drop(self);
        completion.complete(outcome.map(|status| Execution { status, profiler }));
    }

    fn run(&self, buffers: &mut WorkerBuffers, profiler: &mut RequestProfiler) -> Result<Status> {
        let mut saturated = false;
        for run in self.runs.iter() {
            match run.kind {
                SubModelKind::Software => {
                    let count = software::execute_run(
                        &self.model,
                        run,
                        &self.config,
                        &self.kernels,
                        buffers,
                    )?;
                    saturated |= count > 0;
                }
                SubModelKind::Hardware | SubModelKind::GmmHardware => {
                    let hardware = self.model.hardware().ok_or(GnaError::DeviceNotAvailable)?;
                    let driver = self.driver.as_deref().ok_or(GnaError::DeviceNotAvailable)?;
                    let result =
                        hardware.submit(self.model.layers(), &self.config, run, driver, profiler)?;
                    saturated |= result.completion == gna_driver::Completion::Saturated;
                }
            }
        }
        Ok(if saturated {
            Status::WarningArithmeticSaturation
        } else {
            Status::Success
        })
    }
}

fn layer_of(model: &CompiledModel, index: usize) -> Result<&Layer> {
    model
        .layers()
        .get(index)
        .ok_or_else(|| GnaError::invalid_identifier("layer", index as u64))
}

fn next_id(counter: &AtomicU32, kind: &str) -> Result<u32> {
    let id = counter.fetch_add(1, Ordering::Relaxed);
    if id == u32::MAX {
        return Err(GnaError::resource_exhausted(format!("{kind} ids exhausted")));
    }
    Ok(id)
}

fn map(driver: &dyn DriverInterface, memory: &HostMemory) -> Result<()> {
    if let Some(id) = memory.memory_id() {
        return Err(GnaError::invalid_configuration(format!(
            "memory at {:#x} is already mapped as {id}",
            memory.address()
        )));
    }
    let id = driver.map_memory(memory.host_buffer())?;
    if !memory.set_memory_id(id) {
        if let Err(e) = driver.unmap_memory(id) {
            tracing::warn!("Failed to unmap duplicate mapping {id}: {e}");
        }
        return Err(GnaError::invalid_configuration(format!(
            "memory at {:#x} was mapped concurrently",
            memory.address()
        )));
    }
    Ok(())
}

fn unmap(driver: Option<&dyn DriverInterface>, memory: &HostMemory) {
    let (Some(driver), Some(id)) = (driver, memory.memory_id()) else {
        return;
    };
    if let Err(e) = driver.unmap_memory(id) {
        tracing::warn!("Failed to unmap {id} at {:#x}: {e}", memory.address());
    }
}
