//! Simulated device backend
//!
//! An in-process stand-in for `/dev/gnaN` used by CI and tests. It runs the
//! same checks the kernel driver performs on every submission: the record
//! must decode, every buffer id must be a live mapping, every window and
//! patch must stay inside its mapping. It does not score; the status word of
//! each submission comes from a script (default: completed).
//!
//! Knobs:
//! - `with_latency`: hold the device for a fixed time per submission
//! - `with_map_ack_delay`: confirm mappings asynchronously
//! - `with_forbidden_id`: hand out the reserved id on the next map
//! - `push_status`: queue raw status words for upcoming submissions
//! - `refuse_next`: answer upcoming submissions with `Busy`

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gna_chip::protocol::FORBIDDEN_MEMORY_ID;
use gna_chip::{status, DeviceVersion};
use parking_lot::Mutex;
use tracing::debug;

use crate::capabilities::DriverCapabilities;
use crate::error::{DriverError, Result};
use crate::interface::{
    DriverInterface, DriverPerf, DriverType, HardwarePerf, HostBuffer, MemoryId, SubmitResult,
};
use crate::protocol::Submission;
use crate::status::HardwareStatus;
use crate::tracker::MapTracker;

/// Default recovery timeout of the simulated device.
pub const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 1000;

/// Simulated accelerator.
#[derive(Debug)]
pub struct SimulatedDriver {
    caps: DriverCapabilities,
    next_id: AtomicU64,
    mappings: Mutex<HashMap<MemoryId, u64>>,
    tracker: Arc<MapTracker>,
    statuses: Mutex<VecDeque<u32>>,
    log: Mutex<Vec<Submission>>,
    engine: Mutex<()>,
    latency: Duration,
    map_ack_delay: Duration,
    forbidden_next: AtomicBool,
    reserved_releases: AtomicUsize,
    busy_submissions: AtomicU32,
}

impl SimulatedDriver {
    /// Simulated device of the given generation.
    #[must_use]
    pub fn new(version: DeviceVersion) -> Self {
        Self {
            caps: DriverCapabilities::for_version(version, DEFAULT_RECOVERY_TIMEOUT_MS),
            next_id: AtomicU64::new(1),
            mappings: Mutex::new(HashMap::new()),
            tracker: Arc::new(MapTracker::new()),
            statuses: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            engine: Mutex::new(()),
            latency: Duration::ZERO,
            map_ack_delay: Duration::ZERO,
            forbidden_next: AtomicBool::new(false),
            reserved_releases: AtomicUsize::new(0),
            busy_submissions: AtomicU32::new(0),
        }
    }

    /// Hold the device for `latency` on every submission.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Confirm mappings `delay` after the map call.
    #[must_use]
    pub const fn with_map_ack_delay(mut self, delay: Duration) -> Self {
        self.map_ack_delay = delay;
        self
    }

    /// Override the recovery timeout.
    #[must_use]
    pub const fn with_recovery_timeout_ms(mut self, recovery_timeout_ms: u64) -> Self {
        self.caps.recovery_timeout_ms = recovery_timeout_ms;
        self
    }

    /// Make the next map call receive the forbidden identifier.
    #[must_use]
    pub fn with_forbidden_id(self) -> Self {
        self.forbidden_next.store(true, Ordering::SeqCst);
        self
    }

    /// Answer the next `count` submissions with `DriverError::Busy`.
    pub fn refuse_next(&self, count: u32) {
        self.busy_submissions.fetch_add(count, Ordering::SeqCst);
    }

    /// Queue a raw status word for an upcoming submission.
    pub fn push_status(&self, bits: u32) {
        self.statuses.lock().push_back(bits);
    }

    /// Every accepted submission so far, in arrival order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.log.lock().clone()
    }

    /// Number of live mappings.
    #[must_use]
    pub fn mapped_count(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Mappings released because they received the reserved id.
    #[must_use]
    pub fn reserved_releases(&self) -> usize {
        self.reserved_releases.load(Ordering::SeqCst)
    }

    /// Size of a live mapping.
    #[must_use]
    pub fn mapped_size(&self, id: MemoryId) -> Option<u64> {
        self.mappings.lock().get(&id).copied()
    }

    fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.caps.recovery_timeout_ms)
    }

    fn validate(&self, submission: &Submission) -> Result<()> {
        let mappings = self.mappings.lock();
        for entry in &submission.buffers {
            let mapped = *mappings
                .get(&entry.memory_id)
                .ok_or(DriverError::UnknownMemoryId {
                    id: entry.memory_id.get(),
                })?;
            let end = entry.offset.checked_add(entry.size);
            if end.map_or(true, |end| end > mapped) {
                return Err(DriverError::invalid_payload(format!(
                    "window {}+{} exceeds {} of {mapped} bytes",
                    entry.offset, entry.size, entry.memory_id
                )));
            }
            for patch in &entry.patches {
                let patch_end = patch.offset + patch.value.size() as u64;
                if patch_end > entry.size {
                    return Err(DriverError::invalid_payload(format!(
                        "patch at {:#x} exceeds window of {}",
                        patch.offset, entry.memory_id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl DriverInterface for SimulatedDriver {
    fn capabilities(&self) -> &DriverCapabilities {
        &self.caps
    }

    fn map_memory(&self, buffer: HostBuffer) -> Result<MemoryId> {
        let raw = if self.forbidden_next.swap(false, Ordering::SeqCst) {
            FORBIDDEN_MEMORY_ID
        } else {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        };
        let id = MemoryId::new(raw);
        if raw == FORBIDDEN_MEMORY_ID {
            self.reserved_releases.fetch_add(1, Ordering::SeqCst);
            debug!("Released {} bytes mapped under the reserved id", buffer.size);
            return Err(DriverError::ForbiddenMemoryId);
        }
        self.tracker.register(id);

        if self.map_ack_delay.is_zero() {
            self.tracker.confirm(id);
        } else {
            let tracker = Arc::clone(&self.tracker);
            let delay = self.map_ack_delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                tracker.confirm(id);
            });
        }
        self.tracker.poll_confirmed(id, self.recovery_window())?;

        self.mappings.lock().insert(id, buffer.size);
        debug!("Simulated map of {} bytes as {id}", buffer.size);
        Ok(id)
    }

    fn unmap_memory(&self, id: MemoryId) -> Result<()> {
        if self.mappings.lock().remove(&id).is_none() {
            return Err(DriverError::UnknownMemoryId { id: id.get() });
        }
        self.tracker.release(id);
        self.tracker.wait_unmapped(id, self.recovery_window())
    }

    fn submit(&self, payload: &[u8]) -> Result<SubmitResult> {
        let ioctl_submit = Instant::now();
        let submission = Submission::decode(payload)?;
        self.validate(&submission)?;
        if self
            .busy_submissions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            debug!("Simulated device refused a submission as busy");
            return Err(DriverError::Busy);
        }

        let bits = self
            .statuses
            .lock()
            .pop_front()
            .unwrap_or(status::COMPLETED | status::STATISTICS_VALID);

        let patch_count = submission.patch_count() as u64;
        {
            let _engine = self.engine.lock();
            if !self.latency.is_zero() {
                std::thread::sleep(self.latency);
            }
            self.log.lock().push(submission);
        }
        let ioctl_return = Instant::now();
        debug!("Simulated submission done with status {bits:#x}");

        let status = HardwareStatus(bits);
        let completion = status
            .outcome()
            .map_err(|fault| DriverError::Hardware { fault, status: bits })?;
        let elapsed_us = u64::try_from(ioctl_return.duration_since(ioctl_submit).as_micros())
            .unwrap_or(u64::MAX);
        Ok(SubmitResult {
            completion,
            hardware_perf: HardwarePerf {
                total: 1000 + 16 * patch_count,
                stall: patch_count,
            },
            driver_perf: DriverPerf {
                ioctl_submit,
                ioctl_return,
                start_hw: 0,
                complete_hw: elapsed_us,
            },
        })
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Simulated
    }
}
