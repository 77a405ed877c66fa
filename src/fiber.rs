//! Fibers: cooperative coroutines owned by a [`FiberScheduler`].
//!
//! A [`Fiber`] is the description a client hands to the scheduler: a body
//! and the stack it wants. Once added, the scheduler tracks it through a
//! [`FiberRecord`] and the client refers to it only by [`FiberId`].
//!
//! [`FiberScheduler`]: crate::FiberScheduler

use crate::context::ExecutionContext;
use crate::error::FiberError;
use crate::fiber_scheduler::FiberCx;
use crate::handle_table::Handle;
use crate::stack::StackBackup;
use corosensei::stack::DefaultStack;
use std::fmt;

/// Identifier of a fiber within one scheduler.
///
/// Ids are generation-stamped: once a fiber has finished or been destroyed,
/// its id stays unknown to the scheduler even if the slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) Handle);

impl FiberId {
    pub fn to_raw(self) -> u32 {
        self.0.to_raw()
    }

    pub fn from_raw(raw: u32) -> Self {
        FiberId(Handle::from_raw(raw))
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber {}", self.0)
    }
}

/// Caller-chosen token pairing a keyed suspend with the keyed resume meant
/// for it.
///
/// Conventionally the id of the fiber that will do the resuming, which is
/// what the `From<FiberId>` conversion produces.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SuspendKey(pub u64);

impl From<FiberId> for SuspendKey {
    fn from(id: FiberId) -> Self {
        SuspendKey(u64::from(id.to_raw()))
    }
}

impl fmt::Display for SuspendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Scheduling state of a live fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Waiting in the ready list.
    Ready,
    /// Currently executing.
    Running,
    /// Parked until someone resumes it.
    Suspended,
}

pub(crate) type FiberBody = Box<dyn FnOnce(&FiberCx<'_>)>;

pub(crate) enum StackRequest {
    Shared,
    Private(DefaultStack),
}

/// A fiber that has not been handed to a scheduler yet.
pub struct Fiber {
    pub(crate) body: FiberBody,
    pub(crate) stack: StackRequest,
    pub(crate) name: Option<String>,
}

impl Fiber {
    /// A fiber that runs on its scheduler's shared stack.
    ///
    /// # Example
    ///
    /// ```
    /// use jobfiber::{Fiber, FiberScheduler};
    /// use std::time::Duration;
    ///
    /// let mut scheduler = FiberScheduler::default();
    /// scheduler.add(Fiber::new(|cx| {
    ///     cx.yield_now();
    /// }));
    /// scheduler.update(Duration::ZERO);
    /// assert!(scheduler.is_empty());
    /// ```
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&FiberCx<'_>) + 'static,
    {
        Fiber {
            body: Box::new(body),
            stack: StackRequest::Shared,
            name: None,
        }
    }

    /// A fiber with its own stack of at least `size` bytes.
    ///
    /// Switching such a fiber copies nothing, which suits fibers that
    /// yield very often.
    pub fn with_private_stack<F>(size: usize, body: F) -> Result<Self, FiberError>
    where
        F: FnOnce(&FiberCx<'_>) + 'static,
    {
        let stack = DefaultStack::new(size).map_err(|err| FiberError::StackAllocation {
            size,
            reason: err.to_string(),
        })?;
        Ok(Fiber {
            body: Box::new(body),
            stack: StackRequest::Private(stack),
            name: None,
        })
    }

    /// Attaches a name, used in log output.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn uses_shared_stack(&self) -> bool {
        matches!(self.stack, StackRequest::Shared)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("shared_stack", &self.uses_shared_stack())
            .finish_non_exhaustive()
    }
}

/// Scheduler-side bookkeeping for one live fiber.
pub(crate) struct FiberRecord {
    pub(crate) name: Option<String>,
    pub(crate) state: FiberState,
    pub(crate) background: bool,
    /// Present until the context is created on first run.
    pub(crate) launch: Option<(FiberBody, StackRequest)>,
    pub(crate) context: Option<ExecutionContext>,
    pub(crate) backup: StackBackup,
    /// Value handed to the fiber the next time it runs.
    pub(crate) resume_value: usize,
    /// Set when the fiber is resumed while running; its next suspend
    /// returns this value immediately.
    pub(crate) wake: Option<usize>,
    pub(crate) suspend_key: Option<SuspendKey>,
    /// Destroy was requested while the fiber was running.
    pub(crate) doomed: bool,
}

impl FiberRecord {
    pub(crate) fn new(fiber: Fiber, state: FiberState, background: bool) -> Self {
        FiberRecord {
            name: fiber.name,
            state,
            background,
            launch: Some((fiber.body, fiber.stack)),
            context: None,
            backup: StackBackup::default(),
            resume_value: 0,
            wake: None,
            suspend_key: None,
            doomed: false,
        }
    }

    pub(crate) fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspend_key_from_id() {
        let id = FiberId::from_raw(0x0003_0002);
        assert_eq!(SuspendKey::from(id), SuspendKey(0x0003_0002));
        assert_eq!(FiberId::from_raw(id.to_raw()), id);
    }

    #[test]
    fn test_fiber_stack_request() {
        let shared = Fiber::new(|_| {}).named("shared");
        assert!(shared.uses_shared_stack());
        assert_eq!(shared.name.as_deref(), Some("shared"));

        let private = Fiber::with_private_stack(32 * 1024, |_| {}).unwrap();
        assert!(!private.uses_shared_stack());
    }

    #[test]
    fn test_record_starts_unlaunched() {
        let record = FiberRecord::new(Fiber::new(|_| {}), FiberState::Ready, false);
        assert!(record.launch.is_some());
        assert!(record.context.is_none());
        assert_eq!(record.label(), "-");
    }
}
