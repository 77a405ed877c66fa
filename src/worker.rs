//! Worker thread implementation.
//!
//! Worker threads continuously pump a [`JobScheduler`], the same way any other
//! thread does through `do_some_job`. They exist so that work progresses even
//! when no client thread has idle cycles to offer.

use crate::affinity::{ThreadToken, current_thread_token};
use crate::config::SchedulerConfig;
use crate::error::SystemError;
use crate::job_scheduler::JobScheduler;
use crossbeam::channel;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// A worker thread that executes jobs from a scheduler.
pub struct Worker {
    id: usize,
    token: ThreadToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates and starts a new worker thread.
    ///
    /// Blocks until the thread has reported its [`ThreadToken`], so jobs can
    /// be pinned to it as soon as this returns.
    pub fn new(id: usize, scheduler: JobScheduler, config: &SchedulerConfig) -> Result<Self, SystemError> {
        let (token_tx, token_rx) = channel::bounded(1);
        let core = config
            .pinning
            .core_for(id, core_affinity::get_core_ids().map_or(0, |ids| ids.len()));
        let time_slice = Duration::from_micros(config.time_slice_us);
        let max_backoff = Duration::from_micros(config.idle_backoff_max_us.max(1));

        let handle = thread::Builder::new()
            .name(format!("{}-{}", config.thread_name_prefix, id))
            .spawn(move || {
                // Pin worker to its core for better cache locality
                if let Some(core) = core {
                    if let Some(core_id) = core_affinity::get_core_ids().and_then(|ids| ids.get(core).copied()) {
                        core_affinity::set_for_current(core_id);
                    }
                }

                let _ = token_tx.send(current_thread_token());
                Worker::run_loop(id, scheduler, time_slice, max_backoff);
            })?;

        let token = match token_rx.recv() {
            Ok(token) => token,
            Err(_) => {
                // The thread died before reporting in; surface it at join time.
                let _ = handle.join();
                return Err(SystemError::WorkerPanicked(1));
            }
        };

        Ok(Worker {
            id,
            token,
            handle: Some(handle),
        })
    }

    /// Main execution loop for the worker thread.
    fn run_loop(id: usize, scheduler: JobScheduler, time_slice: Duration, max_backoff: Duration) {
        debug!(worker = id, token = %current_thread_token(), "worker started");
        let mut backoff = Duration::from_micros(1);

        while scheduler.keep_running() {
            if scheduler.do_some_job(time_slice) > 0 {
                backoff = Duration::from_micros(1);
            } else {
                // No work available, back off to prevent busy-waiting
                thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);
            }
        }

        debug!(worker = id, "worker stopped");
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Token of the worker's thread, for pinning jobs to it.
    pub fn token(&self) -> ThreadToken {
        self.token
    }

    /// Waits for the worker thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

/// A fixed pool of worker threads sharing one scheduler.
pub struct WorkerPool {
    workers: Vec<Worker>,
    scheduler: JobScheduler,
}

impl WorkerPool {
    /// Spawns `config.resolved_workers()` workers pumping `scheduler`.
    pub fn new(scheduler: JobScheduler, config: &SchedulerConfig) -> Result<Self, SystemError> {
        let count = config.resolved_workers();
        let mut pool = WorkerPool {
            workers: Vec::with_capacity(count),
            scheduler,
        };

        for id in 0..count {
            match Worker::new(id, pool.scheduler.clone(), config) {
                Ok(worker) => pool.workers.push(worker),
                Err(err) => {
                    // Do not leave half a pool spinning.
                    let _ = pool.shutdown();
                    return Err(err);
                }
            }
        }

        debug!(workers = count, pinning = ?config.pinning, "worker pool started");
        Ok(pool)
    }

    /// Returns the number of worker threads in the pool.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Thread tokens of every worker, in worker order.
    pub fn tokens(&self) -> Vec<ThreadToken> {
        self.workers.iter().map(Worker::token).collect()
    }

    /// Stops the scheduler and waits for all threads to finish.
    ///
    /// Jobs still pending stay in the scheduler; any thread may keep pumping
    /// them cooperatively afterwards.
    pub fn shutdown(self) -> Result<(), SystemError> {
        self.scheduler.stop();

        let mut failed_count = 0;
        for worker in self.workers {
            let worker_id = worker.id();
            if worker.join().is_err() {
                failed_count += 1;
                error!(worker = worker_id, "worker panicked during execution");
            }
        }

        if failed_count > 0 {
            Err(SystemError::WorkerPanicked(failed_count))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::Affinity;
    use crate::job::job_fn;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_worker_pool_creation() {
        let pool = WorkerPool::new(JobScheduler::new(), &SchedulerConfig::with_workers(4)).unwrap();
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.tokens().len(), 4);
        pool.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_worker_pool_execution() {
        let scheduler = JobScheduler::new();
        let pool = WorkerPool::new(scheduler.clone(), &SchedulerConfig::with_workers(2)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let ids: Vec<_> = (0..10)
            .map(|_| {
                let counter_clone = counter.clone();
                scheduler.spawn(move |_| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // Workers are not bound to the test thread; wait by polling.
        while ids.iter().any(|&id| !scheduler.is_done(id)) {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_job_pinned_to_worker() {
        let scheduler = JobScheduler::new();
        let pool = WorkerPool::new(scheduler.clone(), &SchedulerConfig::with_workers(2)).unwrap();
        let target = pool.tokens()[1];
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let ids: Vec<_> = (0..20)
            .map(|_| {
                let seen = seen.clone();
                scheduler
                    .add_finalized(
                        job_fn(move |cx| seen.lock().unwrap().push(cx.thread())),
                        None,
                        None,
                        Affinity::Only(target),
                    )
                    .unwrap()
            })
            .collect();

        while ids.iter().any(|&id| !scheduler.is_done(id)) {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(seen.lock().unwrap().iter().all(|&token| token == target));
        pool.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_shutdown_clears_keep_running() {
        let scheduler = JobScheduler::new();
        let pool = WorkerPool::new(scheduler.clone(), &SchedulerConfig::with_workers(1)).unwrap();
        assert!(scheduler.keep_running());
        pool.shutdown().unwrap();
        assert!(!scheduler.keep_running());
    }
}
