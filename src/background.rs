//! Background fibers.
//!
//! A background fiber turns polling (elapsed time, socket readiness) into
//! resumption of the foreground fibers waiting on it. It runs for as long as
//! the scheduler keeps running, or as long as it still has waiters, and
//! parks itself whenever it has nothing to do.
//!
//! [`SleepManager`] is the timer flavour: fibers sleep on it and it wakes
//! them once their deadline has passed.

use crate::fiber::{Fiber, FiberId, SuspendKey};
use crate::fiber_scheduler::{FiberCx, FiberScheduler};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of one [`BackgroundTask::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Nothing to do until someone resumes the task's fiber.
    Idle,
    /// More work is waiting; poll again after the others had a turn.
    More,
}

/// The payload of a background fiber.
pub trait BackgroundTask: 'static {
    fn poll(&mut self, cx: &FiberCx<'_>) -> Poll;

    /// True while fibers still wait on this task; keeps it alive through
    /// shutdown.
    fn has_pending(&self) -> bool;
}

/// Wraps `task` in a fiber that registers itself as background and polls it
/// until the scheduler releases it and no waiter is left.
///
/// The fiber parks with its own id as suspend key, so it can be woken with
/// either a plain resume or `resume_with_id(id, SuspendKey::from(id), _)`.
pub fn background_fiber<T: BackgroundTask>(mut task: T) -> Fiber {
    Fiber::new(move |cx| {
        cx.register_background();
        let key = SuspendKey::from(cx.id());
        while cx.keep_running() || cx.background_keep_running() || task.has_pending() {
            match task.poll(cx) {
                Poll::More => cx.yield_now(),
                Poll::Idle => {
                    cx.suspend_with_id(key);
                }
            }
        }
        debug!(fiber = %cx.id(), "background fiber exiting");
    })
}

/// Longest the manager blocks the thread when it is the only runnable fiber.
const IDLE_NAP: Duration = Duration::from_millis(1);

#[derive(Default)]
struct SleepQueue {
    sleepers: BinaryHeap<Reverse<(Instant, u64, FiberId)>>,
    manager: Option<FiberId>,
    sequence: u64,
}

/// Wakes sleeping fibers once their deadline has passed.
///
/// Cloning gives another handle on the same queue. Fibers sleep through
/// [`sleep_for`](Self::sleep_for); the manager itself runs as a background
/// fiber added with [`spawn`](Self::spawn).
///
/// When fibers are asleep and no other fiber is ready, the manager blocks
/// its OS thread for up to 1ms per poll instead of spinning. Inside a job
/// this holds up the worker thread for that long.
#[derive(Clone, Default)]
pub struct SleepManager {
    queue: Rc<RefCell<SleepQueue>>,
}

impl SleepManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the manager's background fiber to `scheduler`.
    pub fn spawn(&self, scheduler: &mut FiberScheduler) -> FiberId {
        let id = scheduler.add_background(self.fiber());
        self.queue.borrow_mut().manager = Some(id);
        id
    }

    /// The manager's background fiber, for adding it by hand.
    pub fn fiber(&self) -> Fiber {
        background_fiber(SleepTask {
            queue: self.queue.clone(),
        })
        .named("sleep-manager")
    }

    /// Puts the calling fiber to sleep for at least `duration`.
    pub fn sleep_for(&self, cx: &FiberCx<'_>, duration: Duration) {
        self.sleep_until(cx, Instant::now() + duration);
    }

    /// Puts the calling fiber to sleep until `deadline`.
    ///
    /// Without a live manager the fiber yields until the deadline instead.
    pub fn sleep_until(&self, cx: &FiberCx<'_>, deadline: Instant) {
        let manager = {
            let mut queue = self.queue.borrow_mut();
            match queue.manager {
                Some(manager) if cx.state(manager).is_some() => {
                    queue.sequence += 1;
                    let entry = (deadline, queue.sequence, cx.id());
                    queue.sleepers.push(Reverse(entry));
                    Some(manager)
                }
                _ => None,
            }
        };

        let Some(manager) = manager else {
            while Instant::now() < deadline {
                cx.yield_now();
            }
            return;
        };

        trace!(fiber = %cx.id(), ?deadline, "fiber sleeping");
        // The manager parks while it has no sleepers.
        if let Err(err) = cx.resume(manager, 0) {
            debug!("sleep manager vanished: {err}");
        }
        cx.suspend_with_id(SuspendKey::from(manager));
    }

    /// Number of fibers currently asleep.
    pub fn sleeping(&self) -> usize {
        self.queue.borrow().sleepers.len()
    }
}

struct SleepTask {
    queue: Rc<RefCell<SleepQueue>>,
}

impl BackgroundTask for SleepTask {
    fn poll(&mut self, cx: &FiberCx<'_>) -> Poll {
        let now = Instant::now();
        let (due, next) = {
            let mut queue = self.queue.borrow_mut();
            queue.manager = Some(cx.id());
            // Sleepers destroyed before their deadline are forgotten.
            queue.sleepers.retain(|Reverse((_, _, fiber))| cx.state(*fiber).is_some());
            let mut due = Vec::new();
            while let Some(Reverse((deadline, _, fiber))) = queue.sleepers.peek().copied() {
                if deadline > now {
                    break;
                }
                queue.sleepers.pop();
                due.push(fiber);
            }
            let next = queue.sleepers.peek().map(|Reverse((deadline, _, _))| *deadline);
            (due, next)
        };

        let key = SuspendKey::from(cx.id());
        for fiber in due {
            if let Err(err) = cx.resume_with_id(fiber, key, 0) {
                debug!(%fiber, "sleeper not woken: {err}");
            }
        }

        match next {
            None => Poll::Idle,
            Some(deadline) => {
                if cx.ready_len() == 0 {
                    thread::sleep(deadline.saturating_duration_since(Instant::now()).min(IDLE_NAP));
                }
                Poll::More
            }
        }
    }

    fn has_pending(&self) -> bool {
        !self.queue.borrow().sleepers.is_empty()
    }
}
