//! Linux kernel driver backend
//!
//! Talks to `/dev/gnaN` through five IOCTLs:
//!
//! | nr | call | direction |
//! |----|------|-----------|
//! | 1 | GET_PARAM | id in, value out |
//! | 2 | MEMORY_MAP | pointer and size in, memory id out |
//! | 3 | MEMORY_UNMAP | memory id in |
//! | 4 | COMPUTE | submission record in, request id out |
//! | 5 | WAIT | request id and timeout in, status and counters out |

use std::fs::{File, OpenOptions};
use std::os::raw::c_ulong;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use gna_chip::protocol::{param, FORBIDDEN_MEMORY_ID};
use gna_chip::DeviceVersion;
use rustix::fs::OFlags;

use crate::capabilities::DriverCapabilities;
use crate::error::{DriverError, Result};
use crate::interface::{
    DriverInterface, DriverPerf, DriverType, HardwarePerf, HostBuffer, MemoryId, SubmitResult,
};
use crate::status::HardwareStatus;
use crate::tracker::{MapTracker, MAP_POLL_INTERVAL};

/// IOCTL numbers
mod ioctls {
    use std::os::raw::c_ulong;

    const IOC_READ_WRITE: c_ulong = 3;
    const IOC_SIZE_SHIFT: c_ulong = 16;
    const IOC_DIR_SHIFT: c_ulong = 30;
    const GNA_TYPE: u8 = b'C';

    /// `_IOWR(type, nr, size)`
    const fn iowr(nr: u8, size: usize) -> c_ulong {
        (IOC_READ_WRITE << IOC_DIR_SHIFT)
            | ((size as c_ulong) << IOC_SIZE_SHIFT)
            | ((GNA_TYPE as c_ulong) << 8)
            | (nr as c_ulong)
    }

    pub const GET_PARAM: c_ulong = iowr(1, std::mem::size_of::<super::GetParam>());
    pub const MEMORY_MAP: c_ulong = iowr(2, std::mem::size_of::<super::MemoryMap>());
    pub const MEMORY_UNMAP: c_ulong = iowr(3, std::mem::size_of::<super::MemoryUnmap>());
    pub const COMPUTE: c_ulong = iowr(4, std::mem::size_of::<super::Compute>());
    pub const WAIT: c_ulong = iowr(5, std::mem::size_of::<super::Wait>());
}

// ── IOCTL records ────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct GetParam {
    id: u64,
    value: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct MemoryMap {
    user_ptr: u64,
    size: u64,
    memory_id: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct MemoryUnmap {
    memory_id: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct Compute {
    payload_ptr: u64,
    payload_size: u64,
    request_id: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct Wait {
    request_id: u64,
    timeout_ms: u32,
    _pad0: u32,
    hw_status: u32,
    _pad1: u32,
    drv_perf: [u64; 4],
    hw_perf: [u64; 2],
}

/// Kernel driver backend over `/dev/gnaN`.
#[derive(Debug)]
pub struct KernelDriver {
    file: File,
    path: PathBuf,
    caps: DriverCapabilities,
    tracker: MapTracker,
}

impl KernelDriver {
    /// Open `/dev/gna{index}` and query its parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is missing, cannot be opened, or the
    /// parameter queries fail.
    pub fn open(index: usize) -> Result<Self> {
        Self::open_path(format!("/dev/gna{index}"))
    }

    /// Open a device node by path.
    ///
    /// # Errors
    ///
    /// See [`KernelDriver::open`].
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DriverError::device_not_found(path));
        }
        tracing::debug!("Opening {}", path.display());

        // SAFETY: OFlags::CLOEXEC.bits() is a small positive flag value that fits in i32
        #[allow(clippy::cast_possible_wrap)]
        let cloexec = OFlags::CLOEXEC.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(cloexec)
            .open(path)?;

        let mut driver = Self {
            file,
            path: path.to_path_buf(),
            caps: DriverCapabilities::for_version(DeviceVersion::Gna1_0, 0),
            tracker: MapTracker::new(),
        };
        driver.caps = driver.query_capabilities()?;

        tracing::info!(
            "Opened {}: {} ({} KiB input buffer, {} ms recovery)",
            path.display(),
            driver.caps.device_version,
            driver.caps.buffer_size_kb,
            driver.caps.recovery_timeout_ms
        );
        Ok(driver)
    }

    /// Device node path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn query_capabilities(&self) -> Result<DriverCapabilities> {
        let raw_version = self.get_param(param::DEVICE_ID)?;
        let device_version = u32::try_from(raw_version)
            .ok()
            .and_then(DeviceVersion::from_raw)
            .ok_or_else(|| {
                DriverError::capability_query_failed(format!(
                    "unknown device version {raw_version:#x}"
                ))
            })?;
        let recovery_s = self.get_param(param::RECOVERY_TIMEOUT)?;
        let buffer_size_kb = u32::try_from(self.get_param(param::INPUT_BUFFER_S)?)
            .map_err(|_| DriverError::capability_query_failed("input buffer size overflow"))?;
        Ok(DriverCapabilities {
            device_version,
            buffer_size_kb,
            recovery_timeout_ms: recovery_s.saturating_mul(1000),
        })
    }

    fn get_param(&self, id: u64) -> Result<u64> {
        let mut record = GetParam { id, value: 0 };
        self.ioctl(ioctls::GET_PARAM, &mut record).map_err(|e| {
            DriverError::capability_query_failed(format!("GET_PARAM {id} failed: {e}"))
        })?;
        Ok(record.value)
    }

    fn ioctl<T: Pod>(&self, request: c_ulong, record: &mut T) -> std::io::Result<()> {
        // SAFETY: `request` is one of the _IOWR numbers above, each encoding the exact
        // size of its #[repr(C)] Pod record; `record` is a live exclusive borrow for the
        // duration of the call and the fd stays open while `self` exists.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                request as _,
                record as *mut T,
            )
        };
        if ret < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.caps.recovery_timeout_ms)
    }
}

impl DriverInterface for KernelDriver {
    fn capabilities(&self) -> &DriverCapabilities {
        &self.caps
    }

    fn map_memory(&self, buffer: HostBuffer) -> Result<MemoryId> {
        let mut record = MemoryMap {
            user_ptr: buffer.address,
            size: buffer.size,
            memory_id: 0,
        };
        let deadline = Instant::now() + self.recovery_window();
        loop {
            match self.ioctl(ioctls::MEMORY_MAP, &mut record) {
                Ok(()) => break,
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) && Instant::now() < deadline => {
                    std::thread::sleep(MAP_POLL_INTERVAL);
                }
                Err(e) => return Err(DriverError::map_failed(e.to_string())),
            }
        }
        if record.memory_id == FORBIDDEN_MEMORY_ID {
            // the buffer is mapped under the reserved id; hand it back first
            let mut unmap = MemoryUnmap {
                memory_id: record.memory_id,
            };
            if let Err(e) = self.ioctl(ioctls::MEMORY_UNMAP, &mut unmap) {
                tracing::warn!("Failed to release the mapping under the reserved id: {e}");
            }
            return Err(DriverError::ForbiddenMemoryId);
        }
        let id = MemoryId::new(record.memory_id);
        self.tracker.register(id);
        self.tracker.confirm(id);
        tracing::debug!("Mapped {} bytes at {:#x} as {id}", buffer.size, buffer.address);
        Ok(id)
    }

    fn unmap_memory(&self, id: MemoryId) -> Result<()> {
        if !self.tracker.contains(id) {
            return Err(DriverError::UnknownMemoryId { id: id.get() });
        }
        let mut record = MemoryUnmap {
            memory_id: id.get(),
        };
        self.ioctl(ioctls::MEMORY_UNMAP, &mut record)?;
        self.tracker.release(id);
        self.tracker.wait_unmapped(id, self.recovery_window())?;
        tracing::debug!("Unmapped {id}");
        Ok(())
    }

    fn submit(&self, payload: &[u8]) -> Result<SubmitResult> {
        let mut compute = Compute {
            payload_ptr: payload.as_ptr() as u64,
            payload_size: payload.len() as u64,
            request_id: 0,
        };
        let ioctl_submit = Instant::now();
        self.ioctl(ioctls::COMPUTE, &mut compute)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EBUSY) => DriverError::Busy,
                _ => DriverError::submit_failed(e.to_string()),
            })?;

        let timeout = self.caps.submit_timeout();
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let mut wait = Wait {
            request_id: compute.request_id,
            timeout_ms,
            ..Wait::default()
        };
        self.ioctl(ioctls::WAIT, &mut wait)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EBUSY) => DriverError::Busy,
                Some(libc::ETIME) => DriverError::Timeout {
                    duration_ms: u64::from(timeout_ms),
                },
                _ => DriverError::submit_failed(format!("WAIT failed: {e}")),
            })?;
        let ioctl_return = Instant::now();

        let status = HardwareStatus(wait.hw_status);
        let completion = status.outcome().map_err(|fault| {
            tracing::warn!("{} reported {fault:?} (status {:#x})", self.path.display(), wait.hw_status);
            DriverError::Hardware {
                fault,
                status: wait.hw_status,
            }
        })?;

        let hardware_perf = if status.statistics_valid() {
            HardwarePerf {
                total: wait.hw_perf[0],
                stall: wait.hw_perf[1],
            }
        } else {
            HardwarePerf::default()
        };
        Ok(SubmitResult {
            completion,
            hardware_perf,
            driver_perf: DriverPerf {
                ioctl_submit,
                ioctl_return,
                start_hw: wait.drv_perf[1],
                complete_hw: wait.drv_perf[2],
            },
        })
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_encode_record_sizes() {
        assert_eq!(ioctls::GET_PARAM & 0xFF, 1);
        assert_eq!((ioctls::GET_PARAM >> 8) & 0xFF, c_ulong::from(b'C'));
        assert_eq!((ioctls::WAIT >> 16) & 0x3FFF, std::mem::size_of::<Wait>() as c_ulong);
        assert_eq!(ioctls::COMPUTE >> 30, 3);
    }

    #[test]
    fn wait_record_has_no_implicit_padding() {
        assert_eq!(std::mem::size_of::<Wait>(), 8 + 4 + 4 + 4 + 4 + 32 + 16);
    }

    #[test]
    fn missing_node() {
        assert!(matches!(
            KernelDriver::open_path("/dev/gna-does-not-exist"),
            Err(DriverError::DeviceNotFound { .. })
        ));
    }

    #[test]
    #[ignore] // Requires hardware
    fn open_first_device() {
        let driver = KernelDriver::open(0).expect("open /dev/gna0");
        assert!(driver.capabilities().recovery_timeout_ms > 0);
    }
}
