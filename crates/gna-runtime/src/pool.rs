//! Worker thread pool
//!
//! A fixed set of OS threads pulls boxed tasks from one bounded channel.
//! Each worker owns a [`WorkerBuffers`] scratch set that every task it runs
//! reuses, so steady-state software scoring does not allocate.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::check_thread_count;
use crate::error::{GnaError, Result};
use crate::kernels::pwl::PwlSegment;

/// Per-worker scratch space.
#[derive(Debug, Default)]
pub struct WorkerBuffers {
    /// Staged input vectors
    pub input: Vec<u8>,
    /// Staged weights, filters or means
    pub weights: Vec<u8>,
    /// Staged biases or constants
    pub biases: Vec<u8>,
    /// Staged inverse covariances
    pub extra: Vec<u8>,
    /// Decoded activation
    pub segments: Vec<PwlSegment>,
    /// Output being assembled
    pub output: Vec<u8>,
    /// Raw accumulators
    pub sums: Vec<i64>,
    /// Pooled accumulators
    pub pool: Vec<i64>,
    /// Recurrent feedback
    pub feedback: Vec<i64>,
    /// Active-list indices
    pub active: Vec<u32>,
}

/// Unit of work run on a worker.
pub type Task = Box<dyn FnOnce(&mut WorkerBuffers) + Send + 'static>;

/// Fixed-size pool of worker threads.
#[derive(Debug)]
pub struct ThreadPool {
    sender: Option<SyncSender<Task>>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl ThreadPool {
    /// Start `threads` workers over a queue of `capacity` tasks.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::InvalidThreadCount` for a count outside the
    /// accepted range and `GnaError::Io` if a thread cannot be spawned.
    pub fn new(threads: usize, capacity: usize) -> Result<Self> {
        check_thread_count(threads)?;
        let mut pool = Self {
            sender: None,
            workers: Vec::new(),
            capacity: capacity.max(1),
        };
        pool.start(threads)?;
        Ok(pool)
    }

    fn start(&mut self, threads: usize) -> Result<()> {
        let (sender, receiver) = mpsc::sync_channel::<Task>(self.capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("gna-worker-{index}"))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(handle);
        }
        self.sender = Some(sender);
        self.workers = workers;
        tracing::debug!("Started {threads} worker threads");
        Ok(())
    }

    /// Close the queue, let the workers drain it and join them. Later
    /// tasks are refused.
    pub fn shutdown(&mut self) {
        self.sender = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Worker thread exited with a panic");
            }
        }
    }

    /// Number of running workers.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task without blocking.
    ///
    /// # Errors
    ///
    /// Returns `GnaError::QueueFull` when `capacity` tasks are already
    /// queued and `GnaError::ResourceExhausted` if the pool is stopped.
    pub fn execute(&self, task: Task) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| GnaError::resource_exhausted("thread pool is stopped"))?;
        sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => GnaError::QueueFull {
                limit: self.capacity,
            },
            TrySendError::Disconnected(_) => GnaError::resource_exhausted("thread pool is stopped"),
        })
    }

    /// Replace the workers with `threads` new ones. Queued tasks finish on
    /// the old workers first; no worker is interrupted mid-task.
    ///
    /// # Errors
    ///
    /// See [`ThreadPool::new`].
    pub fn set_thread_count(&mut self, threads: usize) -> Result<()> {
        check_thread_count(threads)?;
        if threads == self.workers.len() {
            return Ok(());
        }
        self.shutdown();
        self.start(threads)?;
        tracing::info!("Thread pool resized to {threads} workers");
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>) {
    let mut buffers = WorkerBuffers::default();
    loop {
        let task = receiver.lock().recv();
        match task {
            Ok(task) => task(&mut buffers),
            Err(_) => break,
        }
    }
}
