//! Single-threaded cooperative fiber scheduler.
//!
//! A [`FiberScheduler`] runs many fibers on the thread that owns it. Fibers
//! without a private stack all execute on one shared stack block; whenever
//! such a fiber switches out, the live part of the block is copied into the
//! fiber's backup and copied back before it runs again.
//!
//! Fibers never reach the scheduler through globals. Every body receives a
//! [`FiberCx`], an explicit handle for yielding, suspending and resuming.
//!
//! ```
//! use jobfiber::{Fiber, FiberScheduler};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let mut scheduler = FiberScheduler::default();
//!
//! let consumer_log = log.clone();
//! let consumer = scheduler.add(Fiber::new(move |cx| {
//!     let value = cx.suspend();
//!     consumer_log.borrow_mut().push(value);
//! }));
//! scheduler.add(Fiber::new(move |cx| {
//!     cx.resume(consumer, 42).unwrap();
//! }));
//!
//! scheduler.update(Duration::ZERO);
//! assert_eq!(*log.borrow(), vec![42]);
//! ```

use crate::config::FiberConfig;
use crate::context::{ContextYielder, ExecutionContext, Handoff, Transfer, approximate_sp};
use crate::error::FiberError;
use crate::fiber::{Fiber, FiberBody, FiberId, FiberRecord, FiberState, StackRequest, SuspendKey};
use crate::handle_table::HandleTable;
use crate::job_scheduler::panic_message;
use crate::stack::{FiberStack, SharedStack, StackBackup};
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// A context whose fiber was destroyed while it still had live frames.
struct Grave {
    context: ExecutionContext,
    backup: StackBackup,
}

struct SchedState {
    fibers: HandleTable<FiberRecord>,
    ready: VecDeque<FiberId>,
    suspended: HashSet<FiberId>,
    background: Vec<FiberId>,
    current: Option<FiberId>,
    graveyard: Vec<Grave>,
}

impl SchedState {
    fn record(&self, id: FiberId) -> Result<&FiberRecord, FiberError> {
        self.fibers.get(id.0).ok_or(FiberError::UnknownFiber(id))
    }

    fn record_mut(&mut self, id: FiberId) -> Result<&mut FiberRecord, FiberError> {
        self.fibers.get_mut(id.0).ok_or(FiberError::UnknownFiber(id))
    }

    fn running(&mut self, id: FiberId) -> &mut FiberRecord {
        match self.fibers.get_mut(id.0) {
            Some(record) => record,
            None => panic!("{id} is executing but has no record"),
        }
    }

    /// Removes a fiber from the table and every list.
    fn remove(&mut self, id: FiberId) -> Option<FiberRecord> {
        let record = self.fibers.remove(id.0)?;
        self.ready.retain(|&queued| queued != id);
        self.suspended.remove(&id);
        self.background.retain(|&registered| registered != id);
        Some(record)
    }

    fn bury(&mut self, mut record: FiberRecord) -> FiberRecord {
        if let Some(context) = record.context.take() {
            self.graveyard.push(Grave {
                context,
                backup: std::mem::take(&mut record.backup),
            });
        }
        record
    }
}

/// What happened to a fiber that switched out.
enum Outcome {
    Ready,
    Suspended,
    Doomed,
    Finished,
    Panicked(Box<dyn std::any::Any + Send>),
}

pub(crate) struct SchedCore {
    state: RefCell<SchedState>,
    keep_running: Cell<bool>,
    background_keep_running: Cell<bool>,
    /// Bumped each time a foreground fiber gets the CPU; `stop` uses it to
    /// detect that nothing can make progress any more.
    foreground_runs: Cell<u64>,
    #[cfg_attr(not(windows), allow(dead_code))]
    private_stack_size: usize,
    // Declared last: every context running on it is gone before it is freed.
    stack: SharedStack,
}

impl SchedCore {
    fn new(config: &FiberConfig) -> Self {
        SchedCore {
            state: RefCell::new(SchedState {
                fibers: HandleTable::new(),
                ready: VecDeque::new(),
                suspended: HashSet::new(),
                background: Vec::new(),
                current: None,
                graveyard: Vec::new(),
            }),
            keep_running: Cell::new(true),
            background_keep_running: Cell::new(true),
            foreground_runs: Cell::new(0),
            private_stack_size: config.private_stack_size,
            stack: SharedStack::new(config.shared_stack_size),
        }
    }

    fn insert(&self, fiber: Fiber, suspended: bool, background: bool) -> FiberId {
        let state = if suspended {
            FiberState::Suspended
        } else {
            FiberState::Ready
        };
        let record = FiberRecord::new(fiber, state, background);
        trace!(name = record.label(), ?state, background, "adding fiber");
        let mut st = self.state.borrow_mut();
        let id = FiberId(st.fibers.insert(record));
        if suspended {
            st.suspended.insert(id);
        } else {
            st.ready.push_back(id);
        }
        if background {
            st.background.push(id);
        }
        trace!(fiber = %id, "fiber added");
        id
    }

    fn register_background(&self, id: FiberId) -> Result<(), FiberError> {
        let mut st = self.state.borrow_mut();
        let record = st.record_mut(id)?;
        if !record.background {
            record.background = true;
            st.background.push(id);
            debug!(fiber = %id, "fiber registered as background");
        }
        Ok(())
    }

    fn state_of(&self, id: FiberId) -> Option<FiberState> {
        self.state.borrow().fibers.get(id.0).map(|record| record.state)
    }

    fn resume(&self, id: FiberId, value: usize) -> Result<(), FiberError> {
        let mut st = self.state.borrow_mut();
        let record = st.record_mut(id)?;
        let previous = record.state;
        match previous {
            FiberState::Running => {
                record.wake = Some(value);
                return Ok(());
            }
            FiberState::Ready | FiberState::Suspended => {
                record.state = FiberState::Ready;
                record.resume_value = value;
            }
        }

        if previous == FiberState::Suspended {
            st.suspended.remove(&id);
        } else {
            st.ready.retain(|&queued| queued != id);
        }
        st.ready.push_front(id);
        trace!(fiber = %id, value, "fiber resumed");
        Ok(())
    }

    fn resume_with_id(&self, id: FiberId, key: SuspendKey, value: usize) -> Result<(), FiberError> {
        {
            let st = self.state.borrow();
            let expected = st.record(id)?.suspend_key;
            if expected != Some(key) {
                return Err(FiberError::SuspendKeyMismatch {
                    fiber: id,
                    expected,
                    actual: key,
                });
            }
        }
        self.resume(id, value)
    }

    /// Parks the running fiber `id` until something resumes it.
    fn suspend(&self, id: FiberId, yielder: &ContextYielder, key: Option<SuspendKey>) -> usize {
        {
            let mut st = self.state.borrow_mut();
            let record = st.running(id);
            record.suspend_key = key;
            if let Some(value) = record.wake.take() {
                return value;
            }
        }
        yielder.suspend(Handoff::Suspend { sp: approximate_sp() })
    }

    fn yield_now(&self, yielder: &ContextYielder) {
        yielder.suspend(Handoff::Yield { sp: approximate_sp() });
    }

    fn destroy(&self, id: FiberId) -> Result<(), FiberError> {
        let record = {
            let mut st = self.state.borrow_mut();
            if st.current == Some(id) {
                st.running(id).doomed = true;
                debug!(fiber = %id, "destroy deferred until the fiber switches out");
                return Ok(());
            }
            let record = st.remove(id).ok_or(FiberError::UnknownFiber(id))?;
            st.bury(record)
        };

        debug!(fiber = %id, name = record.label(), "fiber destroyed");
        drop(record);
        self.collect_graves();
        Ok(())
    }

    /// Tears down parked contexts. Does nothing while a fiber executes,
    /// since a shared-stack teardown would overwrite the running fiber's frames.
    fn collect_graves(&self) {
        loop {
            let grave = {
                let mut st = self.state.borrow_mut();
                if st.current.is_some() {
                    return;
                }
                st.graveyard.pop()
            };
            let Some(grave) = grave else {
                return;
            };
            if grave.context.is_suspended() && grave.context.is_shared() {
                // SAFETY: no fiber is executing, and the backup was saved
                // from this stack when the fiber last switched out.
                unsafe { self.stack.restore(&grave.backup) };
            }
            grave.context.destroy();
        }
    }

    fn launch(self: &Rc<Self>, id: FiberId, body: FiberBody, request: StackRequest) -> ExecutionContext {
        let stack = match request {
            StackRequest::Private(stack) => FiberStack::Private(stack),
            StackRequest::Shared => self.shared_stack(),
        };
        let core = Rc::downgrade(self);
        ExecutionContext::create(stack, move |yielder, _| {
            let Some(core) = core.upgrade() else {
                return;
            };
            let cx = FiberCx {
                core: &core,
                id,
                yielder,
            };
            body(&cx);
        })
    }

    #[cfg(not(windows))]
    fn shared_stack(&self) -> FiberStack {
        FiberStack::Shared(self.stack.view())
    }

    // The thread information block must describe whatever stack is active,
    // so on Windows every fiber runs on a stack of its own.
    #[cfg(windows)]
    fn shared_stack(&self) -> FiberStack {
        match corosensei::stack::DefaultStack::new(self.private_stack_size) {
            Ok(stack) => FiberStack::Private(stack),
            Err(err) => panic!("failed to allocate fiber stack: {err}"),
        }
    }

    /// Transfers control to the ready fiber `id` until it switches out.
    ///
    /// Returns false if `id` is stale or no longer ready.
    fn run(self: &Rc<Self>, id: FiberId) -> bool {
        let (mut context, value) = {
            let mut st = self.state.borrow_mut();
            let Some(record) = st.fibers.get_mut(id.0) else {
                return false;
            };
            if record.state != FiberState::Ready {
                return false;
            }
            record.state = FiberState::Running;
            if !record.background {
                self.foreground_runs.set(self.foreground_runs.get() + 1);
            }
            let value = std::mem::take(&mut record.resume_value);
            let context = match (record.context.take(), record.launch.take()) {
                (Some(context), _) => {
                    if context.is_shared() {
                        // SAFETY: no fiber is executing; the backup came from
                        // this stack when the fiber last switched out.
                        unsafe { self.stack.restore(&record.backup) };
                    }
                    context
                }
                (None, Some((body, request))) => self.launch(id, body, request),
                (None, None) => panic!("{id} has neither a context nor a body"),
            };
            st.current = Some(id);
            (context, value)
        };

        let transfer = context.transfer(value);

        let (outcome, retired) = {
            let mut st = self.state.borrow_mut();
            st.current = None;
            let record = st.running(id);
            let outcome = match transfer {
                Transfer::Handoff(handoff) => {
                    let (sp, outcome) = match handoff {
                        Handoff::Yield { sp } => (sp, Outcome::Ready),
                        Handoff::Suspend { sp } => (sp, Outcome::Suspended),
                    };
                    if context.is_shared() {
                        // SAFETY: the fiber has just switched out and `sp`
                        // was taken inside its deepest frame.
                        unsafe { self.stack.save(sp, &mut record.backup) };
                    }
                    record.context = Some(context);
                    if record.doomed { Outcome::Doomed } else { outcome }
                }
                Transfer::Finished => Outcome::Finished,
                Transfer::Panicked(payload) => Outcome::Panicked(payload),
            };

            match outcome {
                Outcome::Ready => {
                    record.state = FiberState::Ready;
                    st.ready.push_back(id);
                    (outcome, None)
                }
                Outcome::Suspended => {
                    record.state = FiberState::Suspended;
                    st.suspended.insert(id);
                    (outcome, None)
                }
                Outcome::Doomed => {
                    let record = st.remove(id).map(|record| st.bury(record));
                    (outcome, record)
                }
                Outcome::Finished | Outcome::Panicked(_) => (outcome, st.remove(id)),
            }
        };

        let label = retired.as_ref().map_or("-", FiberRecord::label);
        match &outcome {
            Outcome::Finished => trace!(fiber = %id, name = label, "fiber finished"),
            Outcome::Doomed => debug!(fiber = %id, name = label, "destroyed fiber switched out"),
            Outcome::Panicked(payload) => {
                error!(fiber = %id, name = label, "fiber panicked: {}", panic_message(payload.as_ref()))
            }
            Outcome::Ready | Outcome::Suspended => {}
        }
        drop(retired);
        self.collect_graves();
        true
    }

    fn update(self: &Rc<Self>, time_slice: Duration) -> usize {
        if self.state.borrow().current.is_some() {
            panic!("FiberScheduler::update called from inside a fiber");
        }

        let start = Instant::now();
        let mut switched = 0;
        let mut swept = false;
        loop {
            let next = self.state.borrow_mut().ready.pop_front();
            match next {
                Some(id) => {
                    if self.run(id) {
                        switched += 1;
                    }
                }
                None if !swept && !self.keep_running.get() => {
                    swept = true;
                    if !self.wake_background() {
                        break;
                    }
                }
                None => break,
            }
            if !time_slice.is_zero() && start.elapsed() >= time_slice {
                break;
            }
        }
        switched
    }

    /// Resumes every parked background fiber so it can observe shutdown.
    fn wake_background(&self) -> bool {
        let parked: Vec<FiberId> = {
            let st = self.state.borrow();
            st.background
                .iter()
                .copied()
                .filter(|&id| st.fibers.get(id.0).is_some_and(|r| r.state == FiberState::Suspended))
                .collect()
        };
        // Pushed to the front one by one; reverse to keep registration order.
        for &id in parked.iter().rev() {
            if let Err(err) = self.resume(id, 0) {
                debug!(fiber = %id, "background sweep skipped fiber: {err}");
            }
        }
        !parked.is_empty()
    }

    fn stop(self: &Rc<Self>) {
        self.keep_running.set(false);
        debug!("fiber scheduler stopping");

        loop {
            let runs_before = self.foreground_runs.get();
            let live_before = self.state.borrow().fibers.len();
            self.update(Duration::ZERO);

            let (live, only_background, background_live) = {
                let st = self.state.borrow();
                let only_background = st.fibers.iter().all(|(_, record)| record.background);
                let background_live = st.fibers.iter().any(|(_, record)| record.background);
                (st.ready.len() + st.suspended.len(), only_background, background_live)
            };
            if live == 0 {
                break;
            }

            let stalled = self.foreground_runs.get() == runs_before && live == live_before;
            if self.background_keep_running.get() && (only_background || stalled) {
                debug!("only background work remains; releasing background fibers");
                self.background_keep_running.set(false);
                continue;
            }
            // Live background fibers still hold pending work; the next sweep
            // polls them again and they may resume the waiters.
            if background_live {
                if stalled {
                    thread::yield_now();
                }
                continue;
            }
            if stalled {
                self.destroy_orphans();
            }
        }
        debug!("fiber scheduler stopped");
    }

    /// Destroys suspended foreground fibers that nothing is left to resume.
    fn destroy_orphans(&self) {
        let orphans: Vec<FiberId> = {
            let st = self.state.borrow();
            st.suspended
                .iter()
                .copied()
                .filter(|&id| st.fibers.get(id.0).is_some_and(|record| !record.background))
                .collect()
        };
        warn!(count = orphans.len(), "stopping with suspended fibers nothing will resume; destroying them");
        for id in orphans {
            if let Err(err) = self.destroy(id) {
                debug!(fiber = %id, "orphan already gone: {err}");
            }
        }
    }

    /// Destroys every fiber, unwinding the ones that hold live frames.
    fn teardown(&self) {
        let records = {
            let mut st = self.state.borrow_mut();
            st.ready.clear();
            st.suspended.clear();
            st.background.clear();
            st.fibers.drain()
        };
        if !records.is_empty() {
            debug!(count = records.len(), "tearing down live fibers");
        }
        for record in records {
            let record = self.state.borrow_mut().bury(record);
            drop(record);
            self.collect_graves();
        }
    }
}

/// Runs fibers cooperatively on the thread that owns it.
///
/// The scheduler is neither `Send` nor `Sync`: fibers, their stacks and the
/// scheduler all stay on one thread. Dropping it destroys every live fiber,
/// unwinding the ones that were suspended mid-body.
pub struct FiberScheduler {
    core: Rc<SchedCore>,
}

impl FiberScheduler {
    pub fn new(config: FiberConfig) -> Self {
        debug!(shared_stack = config.shared_stack_size, "fiber scheduler created");
        FiberScheduler {
            core: Rc::new(SchedCore::new(&config)),
        }
    }

    /// Appends a fiber to the ready list.
    pub fn add(&mut self, fiber: Fiber) -> FiberId {
        self.core.insert(fiber, false, false)
    }

    /// Adds a fiber that does not run until it is resumed.
    pub fn add_suspended(&mut self, fiber: Fiber) -> FiberId {
        self.core.insert(fiber, true, false)
    }

    /// Adds a fiber to the ready list and to the background set.
    pub fn add_background(&mut self, fiber: Fiber) -> FiberId {
        self.core.insert(fiber, false, true)
    }

    /// Runs ready fibers until the ready list is empty or `time_slice` has
    /// elapsed. A zero time slice means no limit.
    ///
    /// Once the scheduler is stopping, the first time the ready list runs dry
    /// every parked background fiber is resumed, even while foreground fibers
    /// are still suspended, since those are usually waiting on a background
    /// fiber.
    ///
    /// Returns the number of times a fiber was switched to.
    pub fn update(&mut self, time_slice: Duration) -> usize {
        self.core.update(time_slice)
    }

    /// Runs the scheduler down: returns once every fiber, background ones
    /// included, has finished.
    ///
    /// Background fibers are resumed when nothing else is ready, and released
    /// through [`FiberCx::background_keep_running`] once only they remain.
    /// While any background fiber is alive the sweeps continue, since it may
    /// still resume the fibers waiting on it. Once none is left, suspended
    /// fibers that nothing can resume any more are destroyed.
    ///
    /// A background fiber that never stops reporting pending work keeps
    /// this call spinning.
    pub fn stop(&mut self) {
        self.core.stop();
    }

    /// Makes a ready or suspended fiber run next, handing it `value`.
    pub fn resume(&mut self, id: FiberId, value: usize) -> Result<(), FiberError> {
        self.core.resume(id, value)
    }

    /// Like [`resume`](Self::resume), but only if `id` last suspended with
    /// `key`.
    pub fn resume_with_id(&mut self, id: FiberId, key: SuspendKey, value: usize) -> Result<(), FiberError> {
        self.core.resume_with_id(id, key, value)
    }

    /// Destroys a fiber, unwinding its frames if it was suspended mid-body.
    pub fn destroy(&mut self, id: FiberId) -> Result<(), FiberError> {
        self.core.destroy(id)
    }

    /// `None` once the fiber has finished or been destroyed.
    pub fn state(&self, id: FiberId) -> Option<FiberState> {
        self.core.state_of(id)
    }

    pub fn ready_len(&self) -> usize {
        self.core.state.borrow().ready.len()
    }

    pub fn suspended_len(&self) -> usize {
        self.core.state.borrow().suspended.len()
    }

    pub fn background_len(&self) -> usize {
        self.core.state.borrow().background.len()
    }

    /// Number of live fibers.
    pub fn len(&self) -> usize {
        self.core.state.borrow().fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keep_running(&self) -> bool {
        self.core.keep_running.get()
    }

    pub fn shared_stack_size(&self) -> usize {
        self.core.stack.capacity()
    }
}

impl Default for FiberScheduler {
    fn default() -> Self {
        Self::new(FiberConfig::default())
    }
}

impl Drop for FiberScheduler {
    fn drop(&mut self) {
        self.core.teardown();
    }
}

/// A running fiber's handle on its scheduler.
///
/// Only exists while the fiber's body executes; every operation acts on the
/// scheduler that runs this fiber.
pub struct FiberCx<'a> {
    core: &'a SchedCore,
    id: FiberId,
    yielder: &'a ContextYielder,
}

impl FiberCx<'_> {
    /// The id of this fiber.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Same as [`id`](Self::id): the fiber currently executing is always
    /// the one holding this handle.
    pub fn current(&self) -> FiberId {
        self.id
    }

    /// Re-queues this fiber at the back of the ready list and lets the
    /// others run.
    pub fn yield_now(&self) {
        self.core.yield_now(self.yielder);
    }

    /// Parks this fiber until it is resumed; returns the resumer's value.
    ///
    /// If the fiber was resumed while it was running, returns at once.
    pub fn suspend(&self) -> usize {
        self.core.suspend(self.id, self.yielder, None)
    }

    /// Parks this fiber so that only a [`resume_with_id`] carrying `key`
    /// may wake it.
    ///
    /// [`resume_with_id`]: Self::resume_with_id
    pub fn suspend_with_id(&self, key: SuspendKey) -> usize {
        self.core.suspend(self.id, self.yielder, Some(key))
    }

    pub fn resume(&self, id: FiberId, value: usize) -> Result<(), FiberError> {
        self.core.resume(id, value)
    }

    pub fn resume_with_id(&self, id: FiberId, key: SuspendKey, value: usize) -> Result<(), FiberError> {
        self.core.resume_with_id(id, key, value)
    }

    /// Resumes `other` and suspends this fiber, so `other` runs next.
    ///
    /// Returns the value this fiber is later resumed with. Switching to
    /// oneself does nothing and returns `Ok(0)`.
    pub fn switch_to(&self, other: FiberId) -> Result<usize, FiberError> {
        if other == self.id {
            return Ok(0);
        }
        self.core.resume(other, 0)?;
        Ok(self.suspend())
    }

    /// Adds a new fiber to the ready list of this scheduler.
    pub fn add(&self, fiber: Fiber) -> FiberId {
        self.core.insert(fiber, false, false)
    }

    pub fn add_suspended(&self, fiber: Fiber) -> FiberId {
        self.core.insert(fiber, true, false)
    }

    /// Puts this fiber in the background set.
    pub fn register_background(&self) {
        if let Err(err) = self.core.register_background(self.id) {
            panic!("running fiber could not register: {err}");
        }
    }

    /// Destroys a fiber. Destroying this fiber takes effect when it next
    /// switches out or returns.
    pub fn destroy(&self, id: FiberId) -> Result<(), FiberError> {
        self.core.destroy(id)
    }

    /// Cleared by [`FiberScheduler::stop`].
    pub fn keep_running(&self) -> bool {
        self.core.keep_running.get()
    }

    /// Cleared during `stop` once only background fibers are left.
    pub fn background_keep_running(&self) -> bool {
        self.core.background_keep_running.get()
    }

    pub fn state(&self, id: FiberId) -> Option<FiberState> {
        self.core.state_of(id)
    }

    /// Fibers waiting in the ready list, not counting this one.
    pub fn ready_len(&self) -> usize {
        self.core.state.borrow().ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Trace = Rc<RefCell<Vec<String>>>;

    fn small() -> FiberScheduler {
        FiberScheduler::new(FiberConfig {
            shared_stack_size: 128 * 1024,
            private_stack_size: 64 * 1024,
        })
    }

    #[test]
    fn test_yield_round_robin() {
        let mut scheduler = small();
        let trace: Trace = Rc::default();
        for name in ["F1", "F2", "F3"] {
            let trace = trace.clone();
            scheduler.add(Fiber::new(move |cx| {
                trace.borrow_mut().push(name.to_string());
                cx.yield_now();
                trace.borrow_mut().push(name.to_string());
            }));
        }

        assert_eq!(scheduler.update(Duration::ZERO), 6);
        assert_eq!(*trace.borrow(), ["F1", "F2", "F3", "F1", "F2", "F3"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_stack_contents_survive_switches() {
        let mut scheduler = small();
        let checked = Rc::new(Cell::new(0));
        for seed in 0..4u8 {
            let checked = checked.clone();
            scheduler.add(Fiber::new(move |cx| {
                let mut buffer = [0u8; 8 * 1024];
                for (i, byte) in buffer.iter_mut().enumerate() {
                    *byte = (i as u8).wrapping_mul(31).wrapping_add(seed);
                }
                cx.yield_now();
                cx.yield_now();
                let buffer = std::hint::black_box(buffer);
                assert!(
                    buffer
                        .iter()
                        .enumerate()
                        .all(|(i, &byte)| byte == (i as u8).wrapping_mul(31).wrapping_add(seed))
                );
                checked.set(checked.get() + 1);
            }));
        }

        scheduler.update(Duration::ZERO);
        assert_eq!(checked.get(), 4);
    }

    #[test]
    fn test_suspend_resume_value() {
        let mut scheduler = small();
        let got = Rc::new(Cell::new(0));
        let got_clone = got.clone();
        let sleeper = scheduler.add(Fiber::new(move |cx| {
            got_clone.set(cx.suspend());
        }));

        scheduler.update(Duration::ZERO);
        assert_eq!(scheduler.state(sleeper), Some(FiberState::Suspended));
        assert_eq!(scheduler.suspended_len(), 1);

        scheduler.resume(sleeper, 17).unwrap();
        assert_eq!(scheduler.state(sleeper), Some(FiberState::Ready));
        scheduler.update(Duration::ZERO);
        assert_eq!(got.get(), 17);
        assert_eq!(scheduler.state(sleeper), None);
    }

    #[test]
    fn test_resume_moves_to_front() {
        let mut scheduler = small();
        let trace: Trace = Rc::default();
        let ids: Vec<_> = ["A", "B", "C"]
            .into_iter()
            .map(|name| {
                let trace = trace.clone();
                scheduler.add(Fiber::new(move |_| trace.borrow_mut().push(name.to_string())))
            })
            .collect();

        scheduler.resume(ids[2], 0).unwrap();
        scheduler.update(Duration::ZERO);
        assert_eq!(*trace.borrow(), ["C", "A", "B"]);
    }

    #[test]
    fn test_keyed_resume() {
        let mut scheduler = small();
        let key = SuspendKey(99);
        let fiber = scheduler.add(Fiber::new(move |cx| {
            assert_eq!(cx.suspend_with_id(key), 5);
        }));
        scheduler.update(Duration::ZERO);

        let err = scheduler.resume_with_id(fiber, SuspendKey(1), 0).unwrap_err();
        assert_eq!(
            err,
            FiberError::SuspendKeyMismatch {
                fiber,
                expected: Some(key),
                actual: SuspendKey(1),
            }
        );
        assert_eq!(scheduler.state(fiber), Some(FiberState::Suspended));

        scheduler.resume_with_id(fiber, key, 5).unwrap();
        scheduler.update(Duration::ZERO);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_resume_while_running_is_not_lost() {
        let mut scheduler = small();
        let got = Rc::new(Cell::new(0));
        let got_clone = got.clone();
        scheduler.add(Fiber::new(move |cx| {
            cx.resume(cx.id(), 3).unwrap();
            got_clone.set(cx.suspend());
        }));
        scheduler.update(Duration::ZERO);
        assert_eq!(got.get(), 3);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_switch_to() {
        let mut scheduler = small();
        let trace: Trace = Rc::default();

        let b_trace = trace.clone();
        let b = scheduler.add_suspended(Fiber::new(move |_| b_trace.borrow_mut().push("B".into())));
        let c_trace = trace.clone();
        let a_trace = trace.clone();
        let a = scheduler.add(Fiber::new(move |cx| {
            a_trace.borrow_mut().push("A1".into());
            assert_eq!(cx.switch_to(cx.id()), Ok(0));
            let value = cx.switch_to(b).unwrap();
            a_trace.borrow_mut().push(format!("A2:{value}"));
        }));
        scheduler.add(Fiber::new(move |_| c_trace.borrow_mut().push("C".into())));

        scheduler.update(Duration::ZERO);
        assert_eq!(*trace.borrow(), ["A1", "B", "C"]);
        assert_eq!(scheduler.state(a), Some(FiberState::Suspended));

        scheduler.resume(a, 8).unwrap();
        scheduler.update(Duration::ZERO);
        assert_eq!(trace.borrow().last().map(String::as_str), Some("A2:8"));
    }

    #[test]
    fn test_destroy_suspended_unwinds() {
        struct Guard(Rc<Cell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let mut scheduler = small();
        let dropped = Rc::new(Cell::new(false));
        let flag = dropped.clone();
        let fiber = scheduler.add(Fiber::new(move |cx| {
            let _guard = Guard(flag);
            cx.suspend();
            unreachable!("destroyed fibers never resume");
        }));

        scheduler.update(Duration::ZERO);
        assert!(!dropped.get());
        scheduler.destroy(fiber).unwrap();
        assert!(dropped.get());
        assert_eq!(scheduler.destroy(fiber), Err(FiberError::UnknownFiber(fiber)));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_destroy_self_is_deferred() {
        let mut scheduler = small();
        let after = Rc::new(Cell::new(false));
        let after_clone = after.clone();
        let fiber = scheduler.add(Fiber::new(move |cx| {
            cx.destroy(cx.id()).unwrap();
            // Still running on our own stack until we switch out.
            after_clone.set(true);
            cx.yield_now();
            unreachable!("destroyed fibers never resume");
        }));

        assert_eq!(scheduler.update(Duration::ZERO), 1);
        assert!(after.get());
        assert_eq!(scheduler.state(fiber), None);
        assert_eq!(scheduler.ready_len(), 0);
    }

    #[test]
    fn test_destroy_from_another_fiber() {
        let mut scheduler = small();
        let victim = scheduler.add_suspended(Fiber::new(|cx| {
            cx.suspend();
        }));
        scheduler.add(Fiber::new(move |cx| {
            cx.destroy(victim).unwrap();
        }));
        scheduler.update(Duration::ZERO);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_private_stack_fiber() {
        let mut scheduler = small();
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        let fiber = Fiber::with_private_stack(64 * 1024, move |cx| {
            for _ in 0..10 {
                count_clone.set(count_clone.get() + 1);
                cx.yield_now();
            }
        })
        .unwrap();
        scheduler.add(fiber);
        scheduler.add(Fiber::new(|cx| cx.yield_now()));

        scheduler.update(Duration::ZERO);
        assert_eq!(count.get(), 10);
    }

    #[test]
    fn test_panicking_fiber_is_finished() {
        let mut scheduler = small();
        let survivor = Rc::new(Cell::new(false));
        let survivor_clone = survivor.clone();
        let doomed = scheduler.add(Fiber::new(|cx| {
            cx.yield_now();
            panic!("fiber failure");
        }));
        scheduler.add(Fiber::new(move |cx| {
            cx.yield_now();
            survivor_clone.set(true);
        }));

        scheduler.update(Duration::ZERO);
        assert!(survivor.get());
        assert_eq!(scheduler.state(doomed), None);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_time_slice_bounds_update() {
        let mut scheduler = small();
        scheduler.add(Fiber::new(|cx| {
            while cx.keep_running() {
                std::thread::sleep(Duration::from_millis(1));
                cx.yield_now();
            }
        }));

        let switched = scheduler.update(Duration::from_millis(5));
        assert!(switched >= 1);
        assert_eq!(scheduler.ready_len(), 1);
        scheduler.stop();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_stop_releases_background_fibers() {
        let mut scheduler = small();
        let exited = Rc::new(Cell::new(false));
        let exited_clone = exited.clone();
        scheduler.add_background(Fiber::new(move |cx| {
            let key = SuspendKey::from(cx.id());
            while cx.keep_running() || cx.background_keep_running() {
                cx.suspend_with_id(key);
            }
            exited_clone.set(true);
        }));
        scheduler.add(Fiber::new(|cx| cx.yield_now()));

        scheduler.update(Duration::ZERO);
        assert_eq!(scheduler.background_len(), 1);
        assert_eq!(scheduler.suspended_len(), 1);

        scheduler.stop();
        assert!(exited.get());
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.background_len(), 0);
    }

    #[test]
    fn test_stop_destroys_orphans() {
        let mut scheduler = small();
        let orphan = scheduler.add(Fiber::new(|cx| {
            cx.suspend();
        }));
        scheduler.add_suspended(Fiber::new(|_| unreachable!("never resumed")));

        scheduler.stop();
        assert_eq!(scheduler.state(orphan), None);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_fibers_spawn_fibers() {
        let mut scheduler = small();
        let trace: Trace = Rc::default();
        let outer = trace.clone();
        scheduler.add(Fiber::new(move |cx| {
            let inner = outer.clone();
            cx.add(Fiber::new(move |_| inner.borrow_mut().push("child".into())));
            outer.borrow_mut().push("parent".into());
        }));
        scheduler.update(Duration::ZERO);
        assert_eq!(*trace.borrow(), ["parent", "child"]);
    }

    #[test]
    fn test_drop_unwinds_suspended_fibers() {
        let dropped = Rc::new(Cell::new(0));
        {
            let mut scheduler = small();
            for _ in 0..3 {
                let dropped = dropped.clone();
                scheduler.add(Fiber::new(move |cx| {
                    struct Count(Rc<Cell<u32>>);
                    impl Drop for Count {
                        fn drop(&mut self) {
                            self.0.set(self.0.get() + 1);
                        }
                    }
                    let _count = Count(dropped);
                    cx.suspend();
                }));
            }
            scheduler.update(Duration::ZERO);
            assert_eq!(dropped.get(), 0);
        }
        assert_eq!(dropped.get(), 3);
    }
}
