//! Job definitions.
//!
//! A job is user work with a single `run` entry point. The scheduler owns the
//! boxed job only until `run` returns for good; a job that asks to be
//! rescheduled is handed back to the pending queue instead.

use crate::affinity::ThreadToken;
use crate::handle_table::Handle;
use crate::job_scheduler::JobScheduler;
use std::cell::Cell;
use std::fmt;

/// Opaque, generation-stamped identifier of a submitted job.
///
/// Two live jobs never share an id. Once a job is done its id may read as
/// done forever, even after the underlying slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) Handle);

impl JobId {
    /// Packed 32-bit form: slot index in the low bits, generation in the high bits.
    pub fn to_raw(self) -> u32 {
        self.0.to_raw()
    }

    pub fn from_raw(raw: u32) -> Self {
        JobId(Handle::from_raw(raw))
    }

    pub fn slot(self) -> usize {
        self.0.index()
    }

    pub fn generation(self) -> u32 {
        self.0.generation()
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of work scheduled across OS threads.
///
/// Failure is the job's own business: the scheduler never inspects outcomes,
/// so a job that can fail records that in state its caller owns.
pub trait Job: Send {
    fn run(&mut self, cx: &JobContext<'_>);
}

impl<F> Job for F
where
    F: FnMut(&JobContext<'_>) + Send,
{
    fn run(&mut self, cx: &JobContext<'_>) {
        self(cx)
    }
}

/// Pins a closure to the job signature so its argument type is inferred.
///
/// ```
/// use jobfiber::{JobScheduler, Affinity, job_fn};
///
/// let scheduler = JobScheduler::new();
/// let id = scheduler.submit(job_fn(|cx| println!("running {}", cx.id())), Affinity::Any);
/// scheduler.finalize(id).unwrap();
/// scheduler.wait(id);
/// ```
pub fn job_fn<F>(f: F) -> F
where
    F: FnMut(&JobContext<'_>) + Send,
{
    f
}

/// What a running job can see of the scheduler.
pub struct JobContext<'a> {
    scheduler: &'a JobScheduler,
    id: JobId,
    thread: ThreadToken,
    reschedule: Cell<Option<bool>>,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(scheduler: &'a JobScheduler, id: JobId, thread: ThreadToken) -> Self {
        JobContext {
            scheduler,
            id,
            thread,
            reschedule: Cell::new(None),
        }
    }

    /// Id of the running job.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The scheduler running this job, for submitting or waiting on more work.
    pub fn scheduler(&self) -> &'a JobScheduler {
        self.scheduler
    }

    /// Token of the thread executing this job.
    pub fn thread(&self) -> ThreadToken {
        self.thread
    }

    /// Scheduler-wide cooperative cancellation flag. Long jobs poll it.
    pub fn keep_running(&self) -> bool {
        self.scheduler.keep_running()
    }

    /// Puts this job back on the pending queue when `run` returns instead of
    /// completing it. With `suspend` set it stays ineligible until resumed.
    pub fn reschedule(&self, suspend: bool) {
        self.reschedule.set(Some(suspend));
    }

    pub(crate) fn take_reschedule(&self) -> Option<bool> {
        self.reschedule.take()
    }
}
