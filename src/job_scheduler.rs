//! Multi-threaded job scheduler.
//!
//! `JobScheduler` keeps every outstanding job as a proxy in a generation-stamped
//! [`HandleTable`] (the open set) plus a FIFO pending queue, both behind one
//! mutex. Any thread can pump it: dedicated workers from a
//! [`WorkerPool`](crate::worker::WorkerPool), or the caller's own thread through
//! [`wait`](JobScheduler::wait) and [`do_some_job`](JobScheduler::do_some_job).
//! The lock is never held while a job runs.
//!
//! ## Holds
//!
//! A proxy stays alive while anything still has an interest in it. Interests
//! are counted explicitly:
//!
//! - the creator, between [`submit`](JobScheduler::submit) and
//!   [`finalize`](JobScheduler::finalize);
//! - the job itself, while its `run` executes;
//! - each child linked with [`add_child`](JobScheduler::add_child), until the
//!   child completes.
//!
//! A proxy is recycled only when its hold count is zero *and* it no longer
//! owns a job, i.e. it finished rather than being rescheduled.

use crate::affinity::{Affinity, ThreadToken, current_thread_token};
use crate::error::JobError;
use crate::handle_table::HandleTable;
use crate::job::{Job, JobContext, JobId};
use crossbeam::utils::{Backoff, CachePadded};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, trace};

struct JobProxy {
    id: JobId,
    /// `None` while `run` executes and once the job is finished.
    job: Option<Box<dyn Job>>,
    running: bool,
    finalized: bool,
    suspended: bool,
    queued: bool,
    affinity: Affinity,
    parent: Option<JobId>,
    /// Satisfied once this id is no longer live.
    dependency: Option<JobId>,
    holds: u32,
}

#[derive(Default)]
struct State {
    proxies: HandleTable<JobProxy>,
    pending: VecDeque<JobId>,
}

impl State {
    fn proxy(&self, id: JobId) -> Result<&JobProxy, JobError> {
        self.proxies.get(id.0).ok_or(JobError::UnknownJob(id))
    }

    fn proxy_mut(&mut self, id: JobId) -> Result<&mut JobProxy, JobError> {
        self.proxies.get_mut(id.0).ok_or(JobError::UnknownJob(id))
    }

    fn is_live(&self, id: JobId) -> bool {
        self.proxies.contains(id.0)
    }

    fn is_eligible(&self, proxy: &JobProxy, thread: ThreadToken) -> bool {
        proxy.queued
            && proxy.finalized
            && !proxy.suspended
            && proxy.affinity.matches(thread)
            && proxy.dependency.is_none_or(|dependency| !self.is_live(dependency))
    }

    /// First eligible job in queue order.
    fn find_eligible(&self, thread: ThreadToken) -> Option<JobId> {
        self.pending.iter().copied().find(|&id| {
            self.proxies
                .get(id.0)
                .is_some_and(|proxy| self.is_eligible(proxy, thread))
        })
    }

    /// Walks the dependency chain of `target` and returns the first link that
    /// can run right now on `thread`.
    fn find_in_chain(&self, target: JobId, thread: ThreadToken) -> Option<JobId> {
        let mut current = target;
        // A chain can never be longer than the open set; bail out on cycles.
        for _ in 0..=self.proxies.len() {
            let proxy = self.proxies.get(current.0)?;
            if self.is_eligible(proxy, thread) {
                return Some(current);
            }
            match proxy.dependency {
                Some(dependency) if self.is_live(dependency) => current = dependency,
                _ => return None,
            }
        }
        None
    }

    /// Moves a pending job into the running state and hands out its payload.
    fn begin(&mut self, id: JobId) -> Box<dyn Job> {
        if let Some(position) = self.pending.iter().position(|&queued| queued == id) {
            self.pending.remove(position);
        }
        let Ok(proxy) = self.proxy_mut(id) else {
            panic!("eligible job {id} has no proxy");
        };
        let Some(job) = proxy.job.take() else {
            panic!("eligible job {id} has no payload");
        };
        proxy.queued = false;
        proxy.running = true;
        proxy.holds += 1;
        job
    }

    /// Drops one interest in `id`, recycling the proxy when nothing is left.
    fn release(&mut self, id: JobId) {
        let Ok(proxy) = self.proxy_mut(id) else {
            panic!("released hold on dead job {id}");
        };
        debug_assert!(proxy.holds > 0, "hold count underflow on {id}");
        proxy.holds -= 1;
        if proxy.holds == 0 && proxy.job.is_none() && !proxy.running {
            self.proxies.remove(id.0);
            trace!(job = %id, "job retired");
        }
    }
}

struct Shared {
    state: Mutex<State>,
    keep_running: CachePadded<AtomicBool>,
    completed: AtomicU64,
}

/// The job scheduler. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct JobScheduler {
    shared: Arc<Shared>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    /// Creates a scheduler with no threads of its own.
    ///
    /// Work only happens when some thread pumps it; attach a
    /// [`WorkerPool`](crate::worker::WorkerPool) for background execution.
    pub fn new() -> Self {
        JobScheduler {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                keep_running: CachePadded::new(AtomicBool::new(true)),
                completed: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Jobs never run under the lock, so poisoning means the bookkeeping
        // itself panicked and nothing sane remains.
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => panic!("job scheduler state poisoned: {poisoned}"),
        }
    }

    /// Submits a job that stays ineligible until [`finalize`](Self::finalize).
    ///
    /// Between the two calls the caller may attach a parent or a dependency.
    pub fn submit<J>(&self, job: J, affinity: Affinity) -> JobId
    where
        J: Job + 'static,
    {
        let mut state = self.lock();
        let id = JobId(state.proxies.insert_with(|handle| JobProxy {
            id: JobId(handle),
            job: Some(Box::new(job)),
            running: false,
            finalized: false,
            suspended: false,
            queued: true,
            affinity,
            parent: None,
            dependency: None,
            holds: 1,
        }));
        state.pending.push_back(id);
        trace!(job = %id, ?affinity, "job submitted");
        id
    }

    /// Makes a submitted job eligible and drops the creator's hold.
    pub fn finalize(&self, id: JobId) -> Result<(), JobError> {
        let mut state = self.lock();
        let proxy = state.proxy_mut(id)?;
        if proxy.finalized {
            return Err(JobError::AlreadyFinalized(id));
        }
        proxy.finalized = true;
        state.release(id);
        trace!(job = %id, "job finalized");
        Ok(())
    }

    /// Submits and finalizes in one step.
    ///
    /// A `dependency` that is already done is accepted and immediately
    /// satisfied. A `parent` must still be live.
    pub fn add_finalized<J>(
        &self,
        job: J,
        parent: Option<JobId>,
        dependency: Option<JobId>,
        affinity: Affinity,
    ) -> Result<JobId, JobError>
    where
        J: Job + 'static,
    {
        let mut state = self.lock();
        if let Some(parent) = parent {
            state.proxy(parent)?;
        }

        let id = JobId(state.proxies.insert_with(|handle| JobProxy {
            id: JobId(handle),
            job: Some(Box::new(job)),
            running: false,
            finalized: true,
            suspended: false,
            queued: true,
            affinity,
            parent,
            dependency,
            holds: 0,
        }));
        if let Some(parent) = parent {
            state.proxy_mut(parent)?.holds += 1;
        }
        state.pending.push_back(id);
        trace!(job = %id, ?parent, ?dependency, ?affinity, "job added");
        Ok(id)
    }

    /// Runs `work` on any thread. Shorthand for an unlinked [`add_finalized`](Self::add_finalized).
    pub fn spawn<F>(&self, work: F) -> JobId
    where
        F: FnMut(&JobContext<'_>) + Send + 'static,
    {
        let mut state = self.lock();
        let id = JobId(state.proxies.insert_with(|handle| JobProxy {
            id: JobId(handle),
            job: Some(Box::new(work)),
            running: false,
            finalized: true,
            suspended: false,
            queued: true,
            affinity: Affinity::Any,
            parent: None,
            dependency: None,
            holds: 0,
        }));
        state.pending.push_back(id);
        id
    }

    /// Makes `parent` wait for `child`: the parent is not done until the child is.
    ///
    /// The child must not be finalized yet and must not already have a parent.
    pub fn add_child(&self, parent: JobId, child: JobId) -> Result<(), JobError> {
        if parent == child {
            return Err(JobError::SelfLink(child));
        }
        let mut state = self.lock();
        state.proxy(parent)?;
        let proxy = state.proxy_mut(child)?;
        if proxy.finalized {
            return Err(JobError::AlreadyFinalized(child));
        }
        if let Some(existing) = proxy.parent {
            return Err(JobError::AlreadyHasParent {
                child,
                parent: existing,
            });
        }
        proxy.parent = Some(parent);
        state.proxy_mut(parent)?.holds += 1;
        Ok(())
    }

    /// Orders `src` after `on`. Must happen before `src` is finalized.
    pub fn depends_on(&self, src: JobId, on: JobId) -> Result<(), JobError> {
        if src == on {
            return Err(JobError::SelfLink(src));
        }
        let mut state = self.lock();
        let proxy = state.proxy_mut(src)?;
        if proxy.finalized {
            return Err(JobError::AlreadyFinalized(src));
        }
        if let Some(dependency) = proxy.dependency {
            return Err(JobError::AlreadyHasDependency {
                job: src,
                dependency,
            });
        }
        proxy.dependency = Some(on);
        Ok(())
    }

    /// Excludes a job from scheduling without touching its links.
    pub fn suspend(&self, id: JobId) -> Result<(), JobError> {
        self.lock().proxy_mut(id)?.suspended = true;
        Ok(())
    }

    /// Undoes [`suspend`](Self::suspend).
    pub fn resume(&self, id: JobId) -> Result<(), JobError> {
        self.lock().proxy_mut(id)?.suspended = false;
        Ok(())
    }

    /// True iff no live job carries exactly this id.
    ///
    /// Ids that were never issued, or whose slot has since been reused,
    /// also read as done.
    pub fn is_done(&self, id: JobId) -> bool {
        !self.lock().is_live(id)
    }

    /// Cooperatively waits for `id`.
    ///
    /// Rather than blocking, the calling thread runs other eligible work:
    /// first whatever link of `id`'s dependency chain is runnable, then any
    /// eligible job. When nothing at all can run here it spins briefly, then
    /// yields the OS thread between polls. Safe to call from inside a job.
    pub fn wait(&self, id: JobId) {
        let token = current_thread_token();
        let backoff = Backoff::new();
        loop {
            let next = {
                let mut state = self.lock();
                if !state.is_live(id) {
                    return;
                }
                state
                    .find_in_chain(id, token)
                    .or_else(|| state.find_eligible(token))
                    .map(|next| (next, state.begin(next)))
            };

            match next {
                Some((next, job)) => {
                    self.execute(next, job, token);
                    backoff.reset();
                }
                None if backoff.is_completed() => thread::yield_now(),
                None => backoff.snooze(),
            }
        }
    }

    /// Runs eligible jobs on the calling thread until none is left or
    /// `timeout` has elapsed. At least one job runs if any is eligible.
    ///
    /// Returns the number of jobs executed.
    pub fn do_some_job(&self, timeout: Duration) -> usize {
        let token = current_thread_token();
        let deadline = Instant::now() + timeout;
        let mut executed = 0;
        loop {
            let next = {
                let mut state = self.lock();
                state
                    .find_eligible(token)
                    .map(|next| (next, state.begin(next)))
            };
            let Some((next, job)) = next else {
                break;
            };
            self.execute(next, job, token);
            executed += 1;
            if Instant::now() >= deadline {
                break;
            }
        }
        executed
    }

    /// Pumps the scheduler on this thread until every job is done.
    ///
    /// Jobs pinned to other threads must be drained by those threads.
    pub fn wait_idle(&self) {
        while self.open_jobs() > 0 {
            if self.do_some_job(Duration::ZERO) == 0 {
                thread::yield_now();
            }
        }
    }

    fn execute(&self, id: JobId, mut job: Box<dyn Job>, thread: ThreadToken) {
        let cx = JobContext::new(self, id, thread);
        let outcome = catch_unwind(AssertUnwindSafe(|| job.run(&cx)));
        let reschedule = match outcome {
            Ok(()) => cx.take_reschedule(),
            Err(payload) => {
                error!(job = %id, "job panicked: {}", panic_message(payload.as_ref()));
                None
            }
        };

        let finished = {
            let mut state = self.lock();
            let Ok(proxy) = state.proxy_mut(id) else {
                panic!("running job {id} lost its proxy");
            };
            proxy.running = false;
            match reschedule {
                Some(suspend) => {
                    proxy.job = Some(job);
                    // A suspend issued while the job ran still stands.
                    proxy.suspended |= suspend;
                    proxy.queued = true;
                    state.pending.push_back(id);
                    state.release(id);
                    trace!(job = %id, suspend, "job rescheduled");
                    None
                }
                None => {
                    debug_assert_eq!(proxy.id, id);
                    if let Some(parent) = proxy.parent.take() {
                        state.release(parent);
                    }
                    state.release(id);
                    Some(job)
                }
            }
        };

        if let Some(job) = finished {
            self.shared.completed.fetch_add(1, Ordering::Relaxed);
            drop(job);
        }
    }

    /// Scheduler-wide cooperative flag that long-running jobs poll.
    pub fn keep_running(&self) -> bool {
        self.shared.keep_running.load(Ordering::Acquire)
    }

    /// Clears the keep-running flag. Workers exit their loops once they see it.
    pub fn stop(&self) {
        self.shared.keep_running.store(false, Ordering::Release);
    }

    /// Number of live proxies: pending, running, or held by children.
    pub fn open_jobs(&self) -> usize {
        self.lock().proxies.len()
    }

    /// Number of jobs sitting in the pending queue, eligible or not.
    pub fn pending_jobs(&self) -> usize {
        self.lock().pending.len()
    }

    /// Total number of jobs whose `run` has completed for good.
    pub fn completed_jobs(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::job_fn;
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: Log, name: &'static str) -> impl FnMut(&JobContext<'_>) + Send + 'static {
        move |_: &JobContext<'_>| log.lock().unwrap().push(name)
    }

    #[test]
    fn test_submit_is_ineligible_until_finalized() {
        let scheduler = JobScheduler::new();
        let id = scheduler.submit(job_fn(|_| {}), Affinity::Any);

        assert_eq!(scheduler.do_some_job(Duration::ZERO), 0);
        assert!(!scheduler.is_done(id));

        scheduler.finalize(id).unwrap();
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 1);
        assert!(scheduler.is_done(id));
        assert_eq!(scheduler.open_jobs(), 0);
    }

    #[test]
    fn test_double_finalize_is_rejected() {
        let scheduler = JobScheduler::new();
        let id = scheduler.submit(job_fn(|_| {}), Affinity::Any);
        scheduler.finalize(id).unwrap();
        assert_eq!(scheduler.finalize(id), Err(JobError::AlreadyFinalized(id)));
    }

    #[test]
    fn test_links_rejected_after_finalize() {
        let scheduler = JobScheduler::new();
        let a = scheduler.submit(job_fn(|_| {}), Affinity::Any);
        let b = scheduler.submit(job_fn(|_| {}), Affinity::Any);
        scheduler.finalize(b).unwrap();

        assert_eq!(scheduler.depends_on(b, a), Err(JobError::AlreadyFinalized(b)));
        assert_eq!(scheduler.add_child(a, b), Err(JobError::AlreadyFinalized(b)));
        assert_eq!(scheduler.depends_on(a, a), Err(JobError::SelfLink(a)));
    }

    #[test]
    fn test_child_cannot_have_two_parents() {
        let scheduler = JobScheduler::new();
        let p1 = scheduler.spawn(|_| {});
        let p2 = scheduler.spawn(|_| {});
        let child = scheduler.submit(job_fn(|_| {}), Affinity::Any);

        scheduler.add_child(p1, child).unwrap();
        assert_eq!(
            scheduler.add_child(p2, child),
            Err(JobError::AlreadyHasParent { child, parent: p1 })
        );
        scheduler.finalize(child).unwrap();
        scheduler.wait_idle();
    }

    #[test]
    fn test_dependency_runs_first() {
        let scheduler = JobScheduler::new();
        let log = Log::default();
        let make = |name| record(log.clone(), name);

        let b = scheduler.submit(make("b"), Affinity::Any);
        let a = scheduler.add_finalized(make("a"), None, None, Affinity::Any).unwrap();
        scheduler.depends_on(b, a).unwrap();
        scheduler.finalize(b).unwrap();

        // `b` sits first in the queue but must not run before `a`.
        scheduler.wait_idle();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_dependency_on_done_job_is_satisfied() {
        let scheduler = JobScheduler::new();
        let a = scheduler.spawn(|_| {});
        scheduler.wait(a);

        let b = scheduler
            .add_finalized(job_fn(|_| {}), None, Some(a), Affinity::Any)
            .unwrap();
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 1);
        assert!(scheduler.is_done(b));
    }

    #[test]
    fn test_wait_runs_dependency_chain() {
        let scheduler = JobScheduler::new();
        let log = Log::default();
        let make = |name| record(log.clone(), name);

        let c = scheduler.submit(make("c"), Affinity::Any);
        let b = scheduler.submit(make("b"), Affinity::Any);
        let a = scheduler.add_finalized(make("a"), None, None, Affinity::Any).unwrap();
        let unrelated = scheduler.add_finalized(make("x"), None, None, Affinity::Any).unwrap();
        scheduler.depends_on(c, b).unwrap();
        scheduler.depends_on(b, a).unwrap();
        scheduler.finalize(b).unwrap();
        scheduler.finalize(c).unwrap();

        scheduler.wait(c);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(!scheduler.is_done(unrelated));
        scheduler.wait(unrelated);
    }

    #[test]
    fn test_parent_outlives_children() {
        let scheduler = JobScheduler::new();
        let parent = scheduler.submit(job_fn(|_| {}), Affinity::Any);
        let c1 = scheduler.submit(job_fn(|_| {}), Affinity::Any);
        let c2 = scheduler.submit(job_fn(|_| {}), Affinity::Any);
        scheduler.add_child(parent, c1).unwrap();
        scheduler.add_child(parent, c2).unwrap();
        scheduler.finalize(parent).unwrap();

        // Parent's own run completes first.
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 1);
        assert!(!scheduler.is_done(parent));

        scheduler.finalize(c1).unwrap();
        scheduler.wait(c1);
        assert!(!scheduler.is_done(parent));

        scheduler.finalize(c2).unwrap();
        scheduler.wait(c2);
        assert!(scheduler.is_done(parent));
        assert_eq!(scheduler.open_jobs(), 0);
    }

    #[test]
    fn test_suspended_job_is_skipped() {
        let scheduler = JobScheduler::new();
        let id = scheduler.spawn(|_| {});
        scheduler.suspend(id).unwrap();
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 0);
        scheduler.resume(id).unwrap();
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 1);
        assert_eq!(scheduler.suspend(id), Err(JobError::UnknownJob(id)));
    }

    #[test]
    fn test_reschedule_keeps_job_alive() {
        let scheduler = JobScheduler::new();
        let steps = Arc::new(AtomicUsize::new(0));
        let steps_clone = steps.clone();
        let id = scheduler.spawn(move |cx| {
            if steps_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                cx.reschedule(false);
            }
        });

        assert_eq!(scheduler.do_some_job(Duration::ZERO), 1);
        assert!(!scheduler.is_done(id));
        scheduler.wait(id);
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.completed_jobs(), 1);
    }

    #[test]
    fn test_reschedule_suspended_waits_for_resume() {
        let scheduler = JobScheduler::new();
        let id = scheduler.spawn(|cx| {
            if cx.keep_running() {
                cx.reschedule(true);
            }
        });
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 1);
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 0);

        scheduler.stop();
        scheduler.resume(id).unwrap();
        scheduler.wait(id);
    }

    #[test]
    fn test_suspend_while_running_survives_reschedule() {
        let scheduler = JobScheduler::new();
        let id = scheduler.spawn(|cx| {
            if cx.keep_running() {
                cx.scheduler().suspend(cx.id()).unwrap();
                cx.reschedule(false);
            }
        });
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 1);
        assert_eq!(scheduler.do_some_job(Duration::ZERO), 0);
        assert!(!scheduler.is_done(id));

        scheduler.stop();
        scheduler.resume(id).unwrap();
        scheduler.wait(id);
        assert!(scheduler.is_done(id));
    }

    #[test]
    fn test_stale_id_reads_done_after_slot_reuse() {
        let scheduler = JobScheduler::new();
        let old = scheduler.spawn(|_| {});
        scheduler.wait(old);
        let new = scheduler.submit(job_fn(|_| {}), Affinity::Any);

        assert_eq!(old.slot(), new.slot());
        assert!(scheduler.is_done(old));
        assert!(!scheduler.is_done(new));
        scheduler.finalize(new).unwrap();
        scheduler.wait_idle();
    }

    #[test]
    fn test_panicking_job_counts_as_done() {
        let scheduler = JobScheduler::new();
        let id = scheduler.spawn(|_| panic!("Intentional panic for testing"));
        scheduler.wait(id);
        assert!(scheduler.is_done(id));
        assert_eq!(scheduler.open_jobs(), 0);
    }

    #[test]
    fn test_pinned_job_skipped_by_other_thread() {
        let scheduler = JobScheduler::new();
        let id = scheduler
            .add_finalized(job_fn(|_| {}), None, None, Affinity::this_thread())
            .unwrap();

        let remote = scheduler.clone();
        let ran = thread::spawn(move || remote.do_some_job(Duration::ZERO))
            .join()
            .unwrap();
        assert_eq!(ran, 0);
        assert!(!scheduler.is_done(id));

        scheduler.wait(id);
    }

    #[test]
    fn test_nested_wait_inside_job() {
        let scheduler = JobScheduler::new();
        let total = Arc::new(AtomicUsize::new(0));
        let total_clone = total.clone();

        let outer = scheduler.spawn(move |cx| {
            let children: Vec<JobId> = (1..=4)
                .map(|i| {
                    let total = total_clone.clone();
                    cx.scheduler().spawn(move |_| {
                        total.fetch_add(i, Ordering::SeqCst);
                    })
                })
                .collect();
            for child in children {
                cx.scheduler().wait(child);
            }
        });

        scheduler.wait(outer);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }
}
