// Bounded worker pool that keeps slow work off the polling threads

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{MailboxError, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Count of submitted-but-unfinished jobs, with a condition variable that
/// fires when it drops to zero.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed number of threads pulling from a bounded queue.
///
/// Submission never blocks: when the queue is full the caller gets
/// `PoolBusy` and decides what to do. A panicking job is logged and the
/// worker keeps running.
pub struct WorkerPool {
    pub(crate) name: String,
    pub(crate) size: usize,
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<InFlight>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, queue_depth: usize) -> Result<Self> {
        if size == 0 || queue_depth == 0 {
            return Err(MailboxError::InvalidConfig(format!(
                "worker pool {name} needs at least one thread and one queue entry"
            )));
        }

        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(InFlight::default());

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let thread_name = format!("{name}-{index}");
            let receiver = Arc::clone(&receiver);
            let in_flight = Arc::clone(&in_flight);
            let pool_name = name.to_string();
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&pool_name, &receiver, &in_flight))
                .map_err(|source| MailboxError::Spawn {
                    name: thread_name,
                    source,
                })?;
            workers.push(handle);
        }

        tracing::debug!(pool = name, size, queue_depth, "worker pool started");

        Ok(Self {
            name: name.to_string(),
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            in_flight,
        })
    }

    /// Size the pool as a fraction of a general task capacity, never below one thread.
    pub fn with_fraction(name: &str, capacity: usize, fraction: f64, queue_depth: usize) -> Result<Self> {
        Self::new(name, pool_size(capacity, fraction), queue_depth)
    }

    /// Queue a job without blocking.
    pub fn try_submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.offer(Box::new(job)).map_err(|(e, _)| e)
    }

    /// Queue an already boxed job without blocking. A rejected job comes back
    /// with the reason so the caller can hold on to it.
    pub fn offer(&self, job: Job) -> std::result::Result<(), (MailboxError, Job)> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err((MailboxError::PoolClosed, job));
        };

        self.in_flight.begin();
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.in_flight.end();
                Err((MailboxError::PoolBusy, job))
            }
            Err(TrySendError::Disconnected(job)) => {
                self.in_flight.end();
                Err((MailboxError::PoolClosed, job))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.count.lock()
    }

    /// Block until no job is queued or running, or until `timeout` passes.
    /// Returns whether the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            if self
                .in_flight
                .idle
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                return *count == 0;
            }
        }
        true
    }

    /// Stop accepting jobs, let queued ones finish, join the threads.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked outside a job");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(pool: &str, receiver: &Mutex<Receiver<Job>>, in_flight: &InFlight) {
    loop {
        let job = {
            let receiver = receiver.lock();
            receiver.recv()
        };
        let Ok(job) = job else {
            break;
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(pool, "task panicked");
        }
        in_flight.end();
    }
}

/// `max(1, ceil(capacity * fraction))`
pub fn pool_size(capacity: usize, fraction: f64) -> usize {
    ((capacity as f64 * fraction).ceil() as usize).max(1)
}
