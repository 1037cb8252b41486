//! Map/unmap acknowledgement tracking.
//!
//! The driver confirms mappings asynchronously. Each id moves through
//! `pending → confirmed → released`; `map` polls for confirmation and
//! `unmap` blocks until both acknowledgements have arrived.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{DriverError, Result};
use crate::interface::MemoryId;

/// Poll interval while waiting for a map confirmation.
pub const MAP_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default)]
struct Acks {
    confirmed: bool,
    released: bool,
}

/// Per-id acknowledgement state.
#[derive(Debug, Default)]
pub struct MapTracker {
    acks: Mutex<HashMap<MemoryId, Acks>>,
    changed: Condvar,
}

impl MapTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping whose confirmation is outstanding.
    pub fn register(&self, id: MemoryId) {
        self.acks.lock().insert(id, Acks::default());
    }

    /// Record the driver's map confirmation.
    pub fn confirm(&self, id: MemoryId) {
        if let Some(acks) = self.acks.lock().get_mut(&id) {
            acks.confirmed = true;
        }
        self.changed.notify_all();
    }

    /// Record the driver's unmap acknowledgement.
    pub fn release(&self, id: MemoryId) {
        if let Some(acks) = self.acks.lock().get_mut(&id) {
            acks.released = true;
        }
        self.changed.notify_all();
    }

    /// Whether `id` is tracked at all.
    #[must_use]
    pub fn contains(&self, id: MemoryId) -> bool {
        self.acks.lock().contains_key(&id)
    }

    /// Poll with sleep until `id` is confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::MapFailed`] if the confirmation does not
    /// arrive within `timeout`, or [`DriverError::UnknownMemoryId`] if the
    /// id was never registered.
    pub fn poll_confirmed(&self, id: MemoryId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.acks.lock().get(&id) {
                None => return Err(DriverError::UnknownMemoryId { id: id.get() }),
                Some(acks) if acks.confirmed => return Ok(()),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(DriverError::map_failed(format!(
                    "{id} not confirmed within {}ms",
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(MAP_POLL_INTERVAL);
        }
    }

    /// Block until `id` has both its map confirmation and its unmap
    /// acknowledgement, then forget it.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Timeout`] if either acknowledgement is still
    /// missing after `timeout`, or [`DriverError::UnknownMemoryId`].
    pub fn wait_unmapped(&self, id: MemoryId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut acks = self.acks.lock();
        loop {
            match acks.get(&id) {
                None => return Err(DriverError::UnknownMemoryId { id: id.get() }),
                Some(a) if a.confirmed && a.released => {
                    acks.remove(&id);
                    return Ok(());
                }
                Some(_) => {}
            }
            if self.changed.wait_until(&mut acks, deadline).timed_out() {
                return Err(DriverError::Timeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unmap_waits_for_late_map_ack() {
        let tracker = Arc::new(MapTracker::new());
        let id = MemoryId::new(3);
        tracker.register(id);
        tracker.release(id);

        let late = Arc::clone(&tracker);
        let confirmer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            late.confirm(id);
        });

        tracker.wait_unmapped(id, Duration::from_secs(2)).unwrap();
        assert!(!tracker.contains(id));
        confirmer.join().unwrap();
    }

    #[test]
    fn poll_times_out_without_confirmation() {
        let tracker = MapTracker::new();
        let id = MemoryId::new(1);
        tracker.register(id);
        let err = tracker
            .poll_confirmed(id, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, DriverError::MapFailed { .. }));
    }

    #[test]
    fn unknown_id() {
        let tracker = MapTracker::new();
        assert!(matches!(
            tracker.wait_unmapped(MemoryId::new(9), Duration::from_millis(1)),
            Err(DriverError::UnknownMemoryId { id: 9 })
        ));
    }
}
