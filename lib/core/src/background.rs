// Bounded worker pool for CPU-bound index builds that must not run on a
// request-handling thread. A fixed set of named workers pull boxed jobs from
// one FIFO queue; callers wait on a per-job channel with an optional timeout
// and cancel the job cooperatively when they stop waiting.

use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cooperative cancellation flag shared between a job and its waiter.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    jobs: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    running: AtomicBool,
}

/// Fixed-size worker pool with a bounded queue.
pub struct BuildPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_pending: usize,
}

impl BuildPool {
    pub fn new(num_workers: usize, max_pending: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            jobs: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let num_workers = num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("subset-build-{}", worker_id))
                .spawn(move || worker_loop(worker_id, &shared))?;
            workers.push(handle);
        }
        tracing::debug!(num_workers, max_pending, "build pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            max_pending: max_pending.max(1),
        })
    }

    /// Queue a job. Fails fast with [`Error::Unavailable`] when the queue is
    /// full or the pool has been shut down.
    pub fn submit<T, F>(&self, job: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let cancel = CancelToken::new();
        let job_cancel = cancel.clone();
        let wrapped: Job = Box::new(move || {
            let outcome = if job_cancel.is_cancelled() {
                Err(Error::BuildCancelled)
            } else {
                job(&job_cancel)
            };
            // The waiter may already have given up.
            let _ = tx.send(outcome);
        });

        {
            let mut jobs = self.shared.jobs.lock();
            // Checked under the queue lock: shutdown flips `running` while
            // holding it, so workers drain everything queued before the flip.
            if !self.shared.running.load(Ordering::Acquire) {
                return Err(Error::Unavailable("build pool is shut down".into()));
            }
            if jobs.len() >= self.max_pending {
                return Err(Error::Unavailable(format!(
                    "{} index builds already queued",
                    jobs.len()
                )));
            }
            jobs.push_back(wrapped);
        }
        self.shared.condvar.notify_one();

        Ok(JobHandle { rx, cancel })
    }

    pub fn pending_jobs(&self) -> usize {
        self.shared.jobs.lock().len()
    }

    /// Stop accepting jobs, let workers drain the queue, and join them.
    pub fn shutdown(&self) {
        {
            let _jobs = self.shared.jobs.lock();
            self.shared.running.store(false, Ordering::Release);
        }
        self.shared.condvar.notify_all();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                tracing::warn!("build worker exited abnormally");
            }
        }
    }
}

impl Drop for BuildPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, shared: &Shared) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock();
            while jobs.is_empty() && shared.running.load(Ordering::Acquire) {
                shared.condvar.wait(&mut jobs);
            }
            match jobs.pop_front() {
                Some(job) => job,
                None => break,
            }
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(worker_id, "index build job panicked");
        }
    }
    tracing::debug!(worker_id, "build worker stopped");
}

/// Waiter side of a submitted job.
pub struct JobHandle<T> {
    rx: Receiver<Result<T>>,
    cancel: CancelToken,
}

impl<T> JobHandle<T> {
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Unavailable("index build was dropped".into())))
    }

    /// Wait at most `timeout`; on expiry the job is cancelled and the caller
    /// gets a retryable [`Error::Unavailable`].
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.cancel.cancel();
                Err(Error::Unavailable(format!(
                    "index build exceeded {} ms",
                    timeout.as_millis()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Unavailable("index build was dropped".into()))
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
