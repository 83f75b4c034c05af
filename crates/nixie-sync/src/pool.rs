//! Fixed-size worker pool.
//!
//! Workers drain a shared Block-policy mailbox of boxed jobs. A panicking
//! job is caught and logged; the worker keeps running. `stop` is idempotent:
//! it stops the queue, lets workers finish the items already queued, and
//! joins them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use nixie_core::constants::POOL_IDLE_POP_TIMEOUT_MS;
use nixie_core::{Error, Result};

use crate::mailbox::{Mailbox, OverflowPolicy, PopError, PushError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads executing submitted jobs
pub struct WorkerPool {
    queue: Arc<Mailbox<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with `thread_count` workers; 0 means available parallelism.
    pub fn new(thread_count: usize) -> Self {
        let thread_count = if thread_count == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            thread_count
        };
        debug_assert!(thread_count > 0);

        // Unbounded in practice: producers must never drop work, and a
        // blocked submit would deadlock callers running on the pool itself.
        let queue: Arc<Mailbox<Job>> = Arc::new(Mailbox::with_capacity(
            nixie_core::constants::MAILBOX_CAPACITY_MAX,
            OverflowPolicy::Block,
        ));

        let workers = (0..thread_count)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::Builder::new()
                    .name(format!("nixie-worker-{i}"))
                    .spawn(move || worker_loop(&queue))
                    .expect("spawning pool worker")
            })
            .collect();

        Self {
            queue,
            workers: Mutex::new(workers),
        }
    }

    /// Submit a job for execution.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.queue.push(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(PushError::Stopped) => Err(Error::PoolStopped),
            Err(PushError::Full { depth, limit }) => Err(Error::MailboxFull { depth, limit }),
        }
    }

    /// Number of jobs waiting for a worker
    pub fn queued_jobs(&self) -> usize {
        self.queue.len()
    }

    /// Number of worker threads (0 after `stop`)
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Whether the pool has been stopped
    pub fn is_stopped(&self) -> bool {
        self.queue.is_stopped()
    }

    /// Stop the pool: queued jobs still run, then workers exit and are joined.
    pub fn stop(&self) {
        self.queue.stop();
        let workers = {
            let mut guard = self.workers.lock();
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            if handle.join().is_err() {
                error!("pool worker terminated by panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(queue: &Mailbox<Job>) {
    loop {
        match queue.wait_and_pop(Duration::from_millis(POOL_IDLE_POP_TIMEOUT_MS)) {
            Ok(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("job panicked; worker continues");
                }
            }
            Err(PopError::TimedOut) => continue,
            Err(PopError::Stopped) => break,
        }
    }
    debug!("pool worker exiting");
}
