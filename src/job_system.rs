//! High-level job system interface.
//!
//! The JobSystem bundles a [`JobScheduler`] with a fixed [`WorkerPool`]. It
//! dereferences to the scheduler, so every scheduling operation is available
//! directly on it.

use crate::config::SchedulerConfig;
use crate::error::SystemError;
use crate::job::{JobContext, JobId};
use crate::job_scheduler::JobScheduler;
use crate::worker::WorkerPool;
use std::ops::Deref;
use tracing::{debug, warn};

/// A job scheduler together with the worker threads that drain it.
pub struct JobSystem {
    scheduler: JobScheduler,
    worker_pool: WorkerPool,
}

impl JobSystem {
    /// Creates a new job system with the specified number of worker threads.
    ///
    /// # Example
    ///
    /// ```
    /// use jobfiber::JobSystem;
    ///
    /// let job_system = JobSystem::new(4).unwrap();
    /// assert_eq!(job_system.num_workers(), 4);
    /// job_system.shutdown().unwrap();
    /// ```
    pub fn new(num_threads: usize) -> Result<Self, SystemError> {
        Self::with_config(&SchedulerConfig::with_workers(num_threads))
    }

    /// Creates a new job system from a full configuration.
    pub fn with_config(config: &SchedulerConfig) -> Result<Self, SystemError> {
        let scheduler = JobScheduler::new();
        let worker_pool = WorkerPool::new(scheduler.clone(), config)?;
        Ok(JobSystem {
            scheduler,
            worker_pool,
        })
    }

    /// Creates a job system with one thread per CPU core.
    pub fn with_default_threads() -> Result<Self, SystemError> {
        Self::with_config(&SchedulerConfig::default())
    }

    /// Submits a closure to run on any thread and returns its id.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use jobfiber::JobSystem;
    ///
    /// let job_system = JobSystem::new(4).unwrap();
    /// let id = job_system.run(|_cx| {
    ///     println!("Hello from a job!");
    /// });
    /// job_system.wait(id);
    /// ```
    pub fn run<F>(&self, work: F) -> JobId
    where
        F: FnMut(&JobContext<'_>) + Send + 'static,
    {
        self.scheduler.spawn(work)
    }

    /// Submits several closures at once; returns their ids in order.
    pub fn run_multiple<I, F>(&self, jobs: I) -> Vec<JobId>
    where
        I: IntoIterator<Item = F>,
        F: FnMut(&JobContext<'_>) + Send + 'static,
    {
        jobs.into_iter().map(|work| self.scheduler.spawn(work)).collect()
    }

    /// Waits for every id in `ids`, helping out on the calling thread.
    pub fn wait_all(&self, ids: &[JobId]) {
        for &id in ids {
            self.scheduler.wait(id);
        }
    }

    /// The underlying scheduler handle.
    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Returns the number of worker threads in the system.
    pub fn num_workers(&self) -> usize {
        self.worker_pool.size()
    }

    /// Thread tokens of the workers, for pinning jobs to a specific worker.
    pub fn worker_tokens(&self) -> Vec<crate::affinity::ThreadToken> {
        self.worker_pool.tokens()
    }

    /// Stops the workers and waits for them to exit.
    ///
    /// Returns `Err` if any worker thread panicked. Jobs left in the queue are
    /// abandoned and dropped together with the last scheduler handle.
    pub fn shutdown(self) -> Result<(), SystemError> {
        let result = self.worker_pool.shutdown();
        let abandoned = self.scheduler.open_jobs();
        if abandoned > 0 {
            warn!(abandoned, "job system shut down with jobs outstanding");
        } else {
            debug!("job system shut down");
        }
        result
    }
}

impl Deref for JobSystem {
    type Target = JobScheduler;

    fn deref(&self) -> &JobScheduler {
        &self.scheduler
    }
}
