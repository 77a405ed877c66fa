//! # jobfiber - Job Scheduler and Fiber Scheduler
//!
//! Two cooperating layers of concurrency:
//!
//! - A **job scheduler** that spreads units of work over OS threads. Jobs can
//!   be linked as parent and child (a parent is only done once its children
//!   are), ordered after one another with a dependency, suspended, and pinned
//!   to or kept away from a particular thread. Any thread can lend itself to
//!   the scheduler through [`JobScheduler::do_some_job`]; a [`JobSystem`]
//!   adds a pool of dedicated worker threads.
//! - A **fiber scheduler** that runs many stackful coroutines cooperatively
//!   on one thread. Fibers share one stack block whose live part is saved and
//!   restored around each switch, or take a private stack. Background fibers
//!   bridge polling (timers, readiness) into resumption of other fibers.
//!
//! ## Example
//!
//! ```no_run
//! use jobfiber::{Affinity, JobSystem, job_fn};
//!
//! let system = JobSystem::new(4).unwrap();
//!
//! let load = system.submit(job_fn(|_| println!("loading")), Affinity::Any);
//! let decode = system.submit(job_fn(|_| println!("decoding")), Affinity::Any);
//! system.depends_on(decode, load).unwrap();
//! system.finalize(load).unwrap();
//! system.finalize(decode).unwrap();
//!
//! system.wait(decode);
//! system.shutdown().unwrap();
//! ```

pub mod affinity;
pub mod background;
pub mod config;
mod context;
pub mod error;
pub mod fiber;
pub mod fiber_scheduler;
pub mod handle_table;
pub mod job;
pub mod job_scheduler;
pub mod job_system;
pub mod stack;
pub mod trace;
pub mod worker;

pub use affinity::{Affinity, ThreadToken, current_thread_token};
pub use background::{BackgroundTask, Poll, SleepManager, background_fiber};
pub use config::{FiberConfig, PinningStrategy, SchedulerConfig};
pub use error::{FiberError, JobError, SystemError};
pub use fiber::{Fiber, FiberId, FiberState, SuspendKey};
pub use fiber_scheduler::{FiberCx, FiberScheduler};
pub use job::{Job, JobContext, JobId, job_fn};
pub use job_scheduler::JobScheduler;
pub use job_system::JobSystem;
