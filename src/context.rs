//! Raw execution contexts.
//!
//! An [`ExecutionContext`] is a suspended register state plus the stack it
//! runs on. It knows nothing about scheduling: the scheduler creates one,
//! transfers control into it, and destroys it. Switching is done by
//! `corosensei`, so no platform-specific code lives here.

use crate::stack::FiberStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Why a fiber handed control back to the scheduler.
///
/// `sp` is an address inside the fiber's deepest frame at the time of the
/// switch; the scheduler uses it to bound the shared-stack backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handoff {
    Yield { sp: usize },
    Suspend { sp: usize },
}

/// The fiber side of a context: used to hand control back.
pub(crate) type ContextYielder = Yielder<usize, Handoff>;

/// Result of one [`ExecutionContext::transfer`].
pub(crate) enum Transfer {
    Handoff(Handoff),
    Finished,
    Panicked(Box<dyn Any + Send>),
}

pub(crate) struct ExecutionContext {
    coroutine: Coroutine<usize, Handoff, (), FiberStack>,
    shared: bool,
}

impl ExecutionContext {
    /// Builds a context that will run `entry` on `stack` the first time it
    /// is transferred to. Nothing runs until then.
    ///
    /// Creating a context writes its initial frame at the top of `stack`, so
    /// for a shared stack this must only happen while no other fiber's image
    /// is live on it.
    pub(crate) fn create<F>(stack: FiberStack, entry: F) -> Self
    where
        F: FnOnce(&ContextYielder, usize) + 'static,
    {
        let shared = stack.is_shared();
        ExecutionContext {
            coroutine: Coroutine::with_stack(stack, entry),
            shared,
        }
    }

    /// Runs the context until it hands control back or ends.
    ///
    /// A panic escaping the fiber body is caught here and returned; the
    /// context is finished afterwards.
    pub(crate) fn transfer(&mut self, value: usize) -> Transfer {
        match catch_unwind(AssertUnwindSafe(|| self.coroutine.resume(value))) {
            Ok(CoroutineResult::Yield(handoff)) => Transfer::Handoff(handoff),
            Ok(CoroutineResult::Return(())) => Transfer::Finished,
            Err(payload) => Transfer::Panicked(payload),
        }
    }

    /// True once the body has started and not yet ended; such a context
    /// still owns live frames that destruction must unwind.
    pub(crate) fn is_suspended(&self) -> bool {
        self.coroutine.started() && !self.coroutine.done()
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.shared
    }

    /// Tears the context down, unwinding any frames it still holds.
    ///
    /// For a shared-stack context the fiber's stack image must already be
    /// back in place.
    pub(crate) fn destroy(self) {
        drop(self.coroutine);
    }
}

/// An address inside the caller's frame.
#[inline(always)]
pub(crate) fn approximate_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}
