//! Request lifecycle
//!
//! ```text
//! Created ─enqueue─► Queued ─worker─► Executing ─► Completed
//!    │                  │                              ▲
//!    └─pool refused─► Rejected      wait timed out ─► Busy
//! ```
//!
//! Every request owns a one-shot channel its worker completes. A request
//! stays in the pending map until a wait collects a terminal result, so
//! it counts against the queue limit and blocks releases while a waiter
//! is still blocked on it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::config::ConfigId;
use crate::error::{GnaError, Result, Status};
use crate::profiler::{InstrumentationConfig, InstrumentationPoint, ProfileReport, RequestProfiler};

/// Request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u32);

impl RequestId {
    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Recorded, not yet handed to a worker
    Created = 0,
    /// Waiting for a worker
    Queued = 1,
    /// Running on a worker
    Executing = 2,
    /// Result available or collected
    Completed = 3,
    /// The worker pool refused the request
    Rejected = 4,
    /// Last wait expired before completion
    Busy = 5,
}

impl RequestState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Queued,
            2 => Self::Executing,
            3 => Self::Completed,
            4 => Self::Rejected,
            5 => Self::Busy,
            _ => Self::Created,
        }
    }
}

/// What a worker produced for a request.
#[derive(Debug)]
pub(crate) struct Execution {
    pub status: Status,
    pub profiler: RequestProfiler,
}

/// Result of a successful wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// `Success` or `WarningArithmeticSaturation`
    pub status: Status,
    /// Instrumentation values, if the configuration asked for them
    pub profile: Option<ProfileReport>,
}

/// Worker side of a request: reports progress and delivers the result.
#[derive(Debug)]
pub(crate) struct Completion {
    id: RequestId,
    state: Arc<AtomicU8>,
    sender: SyncSender<Result<Execution>>,
}

impl Completion {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn executing(&self) {
        self.state
            .store(RequestState::Executing as u8, Ordering::Release);
    }

    pub fn complete(self, result: Result<Execution>) {
        self.state
            .store(RequestState::Completed as u8, Ordering::Release);
        // the waiter may have given up on the device; the result is dropped
        let _ = self.sender.send(result);
    }
}

#[derive(Debug)]
struct Request {
    config: ConfigId,
    state: Arc<AtomicU8>,
    receiver: Arc<Mutex<Receiver<Result<Execution>>>>,
    instrumentation: Option<InstrumentationConfig>,
}

/// Pending-request map with a fixed capacity.
#[derive(Debug)]
pub struct RequestHandler {
    pending: Mutex<HashMap<RequestId, Request>>,
    next_id: AtomicU32,
    max_pending: usize,
}

impl RequestHandler {
    /// Handler accepting up to `max_pending` outstanding requests.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            max_pending,
        }
    }

    /// Record a request and hand it to `dispatch`.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::QueueFull` at the pending limit and whatever
    /// `dispatch` returns when it refuses the request; a refused request is
    /// not kept.
    pub(crate) fn enqueue(
        &self,
        config: ConfigId,
        instrumentation: Option<InstrumentationConfig>,
        dispatch: impl FnOnce(Completion) -> Result<()>,
    ) -> Result<RequestId> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let state = Arc::new(AtomicU8::new(RequestState::Created as u8));
        let id = {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                return Err(GnaError::QueueFull {
                    limit: self.max_pending,
                });
            }
            let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
            pending.insert(
                id,
                Request {
                    config,
                    state: Arc::clone(&state),
                    receiver: Arc::new(Mutex::new(receiver)),
                    instrumentation,
                },
            );
            id
        };

        state.store(RequestState::Queued as u8, Ordering::Release);
        let completion = Completion {
            id,
            state: Arc::clone(&state),
            sender,
        };
        if let Err(e) = dispatch(completion) {
            state.store(RequestState::Rejected as u8, Ordering::Release);
            self.pending.lock().remove(&id);
            tracing::warn!("{id} rejected: {e}");
            return Err(e);
        }
        tracing::debug!("{id} queued for {config}");
        Ok(id)
    }

    /// Block until `id` completes or `timeout` expires.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::Busy` if the timeout expired; the request stays
    /// pending. Any other error consumes the request: the execution error
    /// itself, `GnaError::ExecutionPanicked` if the worker never reported,
    /// or `GnaError::InvalidIdentifier` for unknown or collected ids.
    pub fn wait(&self, id: RequestId, timeout: Option<Duration>) -> Result<RequestOutcome> {
        let channel = self
            .pending
            .lock()
            .get(&id)
            .map(|r| Arc::clone(&r.receiver))
            .ok_or_else(|| GnaError::invalid_identifier("request", id.0))?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let receiver = match deadline {
            Some(deadline) => channel
                .try_lock_until(deadline)
                .ok_or_else(|| self.mark_busy(id))?,
            None => channel.lock(),
        };
        // another waiter collected the result while this one queued
        if !self.pending.lock().contains_key(&id) {
            return Err(GnaError::invalid_identifier("request", id.0));
        }

        let received = match deadline {
            Some(deadline) => {
                receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        let result = match received {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => return Err(self.mark_busy(id)),
            Err(RecvTimeoutError::Disconnected) => Err(GnaError::ExecutionPanicked {
                message: format!("{id} was dropped without a result"),
            }),
        };

        let request = self
            .pending
            .lock()
            .remove(&id)
            .ok_or_else(|| GnaError::invalid_identifier("request", id.0))?;
        drop(receiver);

        match result {
            Ok(mut execution) => {
                execution.profiler.stamp(InstrumentationPoint::Received);
                let profile = request
                    .instrumentation
                    .as_ref()
                    .map(|config| execution.profiler.report(config));
                tracing::debug!("{id} completed: {}", execution.status);
                Ok(RequestOutcome {
                    status: execution.status,
                    profile,
                })
            }
            Err(e) => {
                tracing::debug!("{id} failed: {e}");
                Err(e)
            }
        }
    }

    fn mark_busy(&self, id: RequestId) -> GnaError {
        if let Some(request) = self.pending.lock().get(&id) {
            // a result that arrived after the deadline stays visible
            let _ = request
                .state
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                    (state != RequestState::Completed as u8).then_some(RequestState::Busy as u8)
                });
        }
        GnaError::Busy { request: id.0 }
    }

    /// State of a pending request.
    #[must_use]
    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.pending
            .lock()
            .get(&id)
            .map(|r| RequestState::from_u8(r.state.load(Ordering::Acquire)))
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether any pending request uses `config`.
    #[must_use]
    pub fn has_pending(&self, config: ConfigId) -> bool {
        self.pending.lock().values().any(|r| r.config == config)
    }
}
