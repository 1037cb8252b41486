//! Request profiling
//!
//! A [`RequestProfiler`] travels with each request and stamps the points it
//! passes. On completion the stamps are converted to the configured
//! [`TimeUnit`], relative to enqueue.

use std::fmt;
use std::time::{Duration, Instant};

use gna_driver::{DriverPerf, HardwarePerf};

/// Point of a request's life that can be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentationPoint {
    /// Accepted by `enqueue`
    Enqueued,
    /// Picked up by a worker
    ExecutionStarted,
    /// Submission payload built
    DeviceRequestReady,
    /// Payload handed to the driver
    DeviceRequestSent,
    /// Driver returned
    DeviceRequestCompleted,
    /// Worker finished every run
    ExecutionCompleted,
    /// Result handed to the waiter
    Received,
    /// Driver entered the submit IOCTL
    DriverSubmit,
    /// Driver left the wait IOCTL
    DriverReturn,
    /// Device cycles spent scoring
    HwTotalCycles,
    /// Device cycles stalled on memory
    HwStallCycles,
}

impl InstrumentationPoint {
    /// Every point, in request order.
    pub const ALL: [Self; 11] = [
        Self::Enqueued,
        Self::ExecutionStarted,
        Self::DeviceRequestReady,
        Self::DeviceRequestSent,
        Self::DeviceRequestCompleted,
        Self::ExecutionCompleted,
        Self::Received,
        Self::DriverSubmit,
        Self::DriverReturn,
        Self::HwTotalCycles,
        Self::HwStallCycles,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for InstrumentationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Unit of reported host timestamps. Device counters are always cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnit {
    /// Microseconds
    #[default]
    Microseconds,
    /// Milliseconds
    Milliseconds,
    /// CPU timestamp-counter ticks (nanoseconds where unavailable)
    Cycles,
}

/// What to record for requests of one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationConfig {
    /// Points to report, in report order
    pub points: Vec<InstrumentationPoint>,
    /// Host timestamp unit
    pub unit: TimeUnit,
    /// Device performance-counter selection
    pub hw_perf_encoding: u8,
}

impl InstrumentationConfig {
    /// Report `points` in `unit`.
    #[must_use]
    pub fn new(points: &[InstrumentationPoint], unit: TimeUnit) -> Self {
        Self {
            points: points.to_vec(),
            unit,
            hw_perf_encoding: 0,
        }
    }

    /// Select device performance counters.
    #[must_use]
    pub const fn with_hw_perf_encoding(mut self, encoding: u8) -> Self {
        self.hw_perf_encoding = encoding;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    at: Instant,
    ticks: Option<u64>,
}

impl Stamp {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            ticks: cycle_counter(),
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[allow(unsafe_code)]
fn cycle_counter() -> Option<u64> {
    // SAFETY: RDTSC has no preconditions and exists on every x86_64 CPU.
    Some(unsafe { core::arch::x86_64::_rdtsc() })
}

#[cfg(not(target_arch = "x86_64"))]
fn cycle_counter() -> Option<u64> {
    None
}

/// Timestamps of one request.
#[derive(Debug, Clone)]
pub struct RequestProfiler {
    stamps: [Option<Stamp>; 9],
    hardware: Option<HardwarePerf>,
}

impl RequestProfiler {
    /// Profiler stamped at enqueue.
    #[must_use]
    pub fn start() -> Self {
        let mut profiler = Self {
            stamps: [None; 9],
            hardware: None,
        };
        profiler.stamp(InstrumentationPoint::Enqueued);
        profiler
    }

    /// Record a host point. Device counters are recorded through
    /// [`record_driver`](Self::record_driver).
    pub fn stamp(&mut self, point: InstrumentationPoint) {
        if let Some(slot) = self.stamps.get_mut(point.index()) {
            *slot = Some(Stamp::now());
        }
    }

    /// Record the counters of one driver submission. Device cycles add up
    /// across runs. Driver timestamps keep the first submit and last return
    /// and are reported in nanoseconds when cycles are requested.
    pub fn record_driver(&mut self, hardware: HardwarePerf, driver: &DriverPerf) {
        let total = self.hardware.get_or_insert(HardwarePerf::default());
        total.total += hardware.total;
        total.stall += hardware.stall;

        let submit = InstrumentationPoint::DriverSubmit.index();
        if self.stamps[submit].is_none() {
            self.stamps[submit] = Some(Stamp {
                at: driver.ioctl_submit,
                ticks: None,
            });
        }
        self.stamps[InstrumentationPoint::DriverReturn.index()] = Some(Stamp {
            at: driver.ioctl_return,
            ticks: None,
        });
    }

    /// Convert the recorded points.
    #[must_use]
    pub fn report(&self, config: &InstrumentationConfig) -> ProfileReport {
        let values = config
            .points
            .iter()
            .map(|&point| (point, self.value(point, config.unit)))
            .collect();
        ProfileReport {
            unit: config.unit,
            values,
        }
    }

    fn value(&self, point: InstrumentationPoint, unit: TimeUnit) -> Option<u64> {
        match point {
            InstrumentationPoint::HwTotalCycles => self.hardware.map(|h| h.total),
            InstrumentationPoint::HwStallCycles => self.hardware.map(|h| h.stall),
            _ => {
                let origin = self.stamps[InstrumentationPoint::Enqueued.index()]?;
                let stamp = self.stamps[point.index()]?;
                Some(convert(origin, stamp, unit))
            }
        }
    }
}

fn convert(origin: Stamp, stamp: Stamp, unit: TimeUnit) -> u64 {
    let elapsed = stamp.at.saturating_duration_since(origin.at);
    match unit {
        TimeUnit::Microseconds => saturate(elapsed.as_micros()),
        TimeUnit::Milliseconds => saturate(elapsed.as_millis()),
        TimeUnit::Cycles => match (origin.ticks, stamp.ticks) {
            (Some(from), Some(to)) => to.saturating_sub(from),
            _ => saturate(elapsed.as_nanos()),
        },
    }
}

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Reported values of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileReport {
    /// Unit of host timestamps
    pub unit: TimeUnit,
    /// Configured points with their value, `None` if never reached
    pub values: Vec<(InstrumentationPoint, Option<u64>)>,
}

impl ProfileReport {
    /// Value of one point.
    #[must_use]
    pub fn get(&self, point: InstrumentationPoint) -> Option<u64> {
        self.values
            .iter()
            .find(|(p, _)| *p == point)
            .and_then(|(_, v)| *v)
    }

    /// Host time between two reported points, if both were reached and
    /// the unit is a time unit.
    #[must_use]
    pub fn between(&self, from: InstrumentationPoint, to: InstrumentationPoint) -> Option<Duration> {
        let delta = self.get(to)?.checked_sub(self.get(from)?)?;
        match self.unit {
            TimeUnit::Microseconds => Some(Duration::from_micros(delta)),
            TimeUnit::Milliseconds => Some(Duration::from_millis(delta)),
            TimeUnit::Cycles => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreached_points_are_none() {
        let mut profiler = RequestProfiler::start();
        profiler.stamp(InstrumentationPoint::ExecutionStarted);
        let config = InstrumentationConfig::new(
            &[
                InstrumentationPoint::Enqueued,
                InstrumentationPoint::ExecutionStarted,
                InstrumentationPoint::DeviceRequestSent,
                InstrumentationPoint::HwTotalCycles,
            ],
            TimeUnit::Microseconds,
        );
        let report = profiler.report(&config);
        assert_eq!(report.values.len(), 4);
        assert_eq!(report.get(InstrumentationPoint::Enqueued), Some(0));
        assert!(report.get(InstrumentationPoint::ExecutionStarted).is_some());
        assert_eq!(report.get(InstrumentationPoint::DeviceRequestSent), None);
        assert_eq!(report.get(InstrumentationPoint::HwTotalCycles), None);
    }

    #[test]
    fn device_cycles_accumulate() {
        let mut profiler = RequestProfiler::start();
        let now = Instant::now();
        let perf = DriverPerf {
            ioctl_submit: now,
            ioctl_return: now,
            start_hw: 0,
            complete_hw: 0,
        };
        profiler.record_driver(HardwarePerf { total: 100, stall: 7 }, &perf);
        profiler.record_driver(HardwarePerf { total: 50, stall: 3 }, &perf);
        let report = profiler.report(&InstrumentationConfig::new(
            &[InstrumentationPoint::HwTotalCycles, InstrumentationPoint::HwStallCycles],
            TimeUnit::Cycles,
        ));
        assert_eq!(report.get(InstrumentationPoint::HwTotalCycles), Some(150));
        assert_eq!(report.get(InstrumentationPoint::HwStallCycles), Some(10));
    }

    #[test]
    fn milliseconds_track_elapsed_time() {
        let mut profiler = RequestProfiler::start();
        std::thread::sleep(Duration::from_millis(5));
        profiler.stamp(InstrumentationPoint::Received);
        let report = profiler.report(&InstrumentationConfig::new(
            &[InstrumentationPoint::Enqueued, InstrumentationPoint::Received],
            TimeUnit::Milliseconds,
        ));
        let elapsed = report
            .between(InstrumentationPoint::Enqueued, InstrumentationPoint::Received)
            .unwrap();
        assert!(elapsed >= Duration::from_millis(5));
    }
}
