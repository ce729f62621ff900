//! # Recognition Worker Pool
//!
//! A fixed number of OS threads draining one shared FIFO queue. All recognition
//! work runs here so that WebSocket I/O never waits on the engine.
//!
//! ## Guarantees:
//! - **Non-blocking submission**: the queue is unbounded; `submit` only takes a
//!   short read lock on the sender slot.
//! - **Fixed size**: threads are spawned once in `new` and never grow.
//! - **Graceful drain**: `shutdown` closes the queue, lets workers finish every task
//!   already queued, then joins them.
//! - **Contained failures**: a task that returns an error or panics is logged at the
//!   worker boundary; the worker keeps serving.
//!
//! `shutdown` must not be called from inside a task: it joins the workers.

use crate::error::PoolError;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Pool size used when the operator does not pick one: at least four workers,
/// more on machines with more hardware threads.
pub fn default_size() -> usize {
    let parallelism = thread::available_parallelism().map_or(1, |n| n.get());
    parallelism.max(4)
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl PoolCounters {
    fn task_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn task_finished(&self, ok: bool) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of the pool, reported by the health endpoint.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub running: bool,
}

/// Fixed-size pool of workers consuming tasks of type `T`.
pub struct WorkerPool<T: Send + 'static> {
    sender: RwLock<Option<Sender<T>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    counters: Arc<PoolCounters>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `size` workers (at least one) that pass each task to `handler`.
    ///
    /// ## Parameters:
    /// - **name**: thread name prefix, workers are named `<name>-<index>`
    /// - **size**: number of worker threads
    /// - **handler**: runs one task; errors and panics are logged and swallowed
    pub fn new<F>(name: &str, size: usize, handler: F) -> std::io::Result<Self>
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<T>();
        let handler = Arc::new(handler);
        let counters = Arc::new(PoolCounters::default());

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handler = Arc::clone(&handler);
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(index, &receiver, handler.as_ref(), &counters))?;
            workers.push(handle);
        }

        info!(workers = size, name, "Worker pool started");

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
            counters,
        })
    }

    /// Queue a task and return immediately.
    pub fn submit(&self, task: T) -> Result<(), PoolError> {
        let slot = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let sender = slot.as_ref().ok_or(PoolError::ShutDown)?;
        sender.send(task).map_err(|_| PoolError::ShutDown)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting work, drain the queue and join every worker.
    ///
    /// Idempotent; later calls return immediately.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        // Workers exit once the queue is empty and no sender is left.
        drop(sender);

        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread terminated outside the task boundary");
            }
        }
        info!(workers = count, "Worker pool drained and stopped");
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.size(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::SeqCst),
            running: self.is_running(),
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T, F>(index: usize, receiver: &Receiver<T>, handler: &F, counters: &PoolCounters)
where
    F: Fn(T) -> anyhow::Result<()>,
{
    while let Ok(task) = receiver.recv() {
        counters.task_started();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(task)));
        let ok = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(worker = index, error = %format!("{err:#}"), "Task failed");
                false
            }
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("unknown panic");
                error!(worker = index, panic = msg, "Task panicked");
                false
            }
        };
        counters.task_finished(ok);
    }
    debug!(worker = index, "Worker exiting");
}
