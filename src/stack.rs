//! Fiber stacks.
//!
//! A [`SharedStack`] is one heap block that every shared-stack fiber of a
//! scheduler executes on, one at a time. When such a fiber leaves the CPU the
//! live part of the block (from just below its stack pointer up to the top) is
//! copied into the fiber's [`StackBackup`], and copied back in before it runs
//! again. Fibers that switch very often can take a private stack instead and
//! skip the copies.

use corosensei::stack::{DefaultStack, Stack, StackPointer};
use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;

#[cfg(windows)]
use corosensei::stack::StackTebFields;

/// Alignment of stack tops and bottoms.
pub const STACK_ALIGN: usize = 16;

/// Smallest shared stack the scheduler will allocate.
pub const MIN_SHARED_STACK: usize = 16 * 1024;

/// Bytes below a fiber's reported suspension point that are still live: the
/// frames of the switch itself and the registers it saves.
pub(crate) const SWITCH_RESERVE: usize = 4096;

/// A fixed block of memory used as the execution stack of many fibers.
///
/// Nothing guards the bottom of the block: overflowing it corrupts the heap.
/// Size it for the deepest fiber.
pub struct SharedStack {
    base_ptr: NonNull<u8>,
    capacity: usize,
}

impl SharedStack {
    /// Allocates a shared stack of at least `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Aborts through `handle_alloc_error` if the allocation fails.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_SHARED_STACK).next_multiple_of(STACK_ALIGN);
        let layout = Self::layout(capacity);

        let ptr = unsafe { alloc(layout) };
        let Some(base_ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        Self { base_ptr, capacity }
    }

    fn layout(capacity: usize) -> Layout {
        match Layout::from_size_align(capacity, STACK_ALIGN) {
            Ok(layout) => layout,
            Err(err) => panic!("invalid shared stack size {capacity}: {err}"),
        }
    }

    /// Highest address (exclusive); stacks grow down from here.
    pub fn base(&self) -> usize {
        (self.base_ptr.as_ptr() as usize + self.capacity) & !(STACK_ALIGN - 1)
    }

    /// Lowest usable address.
    pub fn limit(&self) -> usize {
        self.base_ptr.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg_attr(windows, allow(dead_code))]
    pub(crate) fn view(&self) -> SharedStackView {
        SharedStackView {
            base: nonzero(self.base()),
            limit: nonzero(self.limit()),
        }
    }

    /// Copies the live part of the stack, from `sp - SWITCH_RESERVE` up to
    /// the base, into `backup`.
    ///
    /// # Safety
    ///
    /// No code may be executing on the shared stack, and `sp` must be a
    /// stack address reported by the fiber that just left it.
    pub(crate) unsafe fn save(&self, sp: usize, backup: &mut StackBackup) {
        debug_assert!(
            sp > self.limit() && sp <= self.base(),
            "suspension point {sp:#x} outside shared stack"
        );
        let low = (sp.saturating_sub(SWITCH_RESERVE) & !(STACK_ALIGN - 1)).max(self.limit());
        let len = self.base() - low;

        backup.bytes.clear();
        backup.bytes.reserve(len);
        unsafe {
            std::ptr::copy_nonoverlapping(low as *const u8, backup.bytes.as_mut_ptr(), len);
            backup.bytes.set_len(len);
        }
        backup.low = low;
    }

    /// Puts a previously saved stack image back in place.
    ///
    /// # Safety
    ///
    /// No code may be executing on the shared stack, and `backup` must have
    /// been filled by [`save`](Self::save) on this same stack.
    pub(crate) unsafe fn restore(&self, backup: &StackBackup) {
        if backup.bytes.is_empty() {
            return;
        }
        debug_assert_eq!(backup.low + backup.bytes.len(), self.base());
        unsafe {
            std::ptr::copy_nonoverlapping(backup.bytes.as_ptr(), backup.low as *mut u8, backup.bytes.len());
        }
    }
}

impl Drop for SharedStack {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base_ptr.as_ptr(), Self::layout(self.capacity));
        }
    }
}

fn nonzero(addr: usize) -> StackPointer {
    match StackPointer::new(addr) {
        Some(sp) => sp,
        None => panic!("null stack address"),
    }
}

/// Saved image of a shared-stack fiber's live stack.
#[derive(Default)]
pub struct StackBackup {
    bytes: Vec<u8>,
    low: usize,
}

impl StackBackup {
    /// Number of bytes currently saved.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Bounds of a [`SharedStack`] handed to a coroutine.
///
/// Many views alias one block; the scheduler makes sure only one fiber
/// occupies it at a time.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(windows, allow(dead_code))]
pub(crate) struct SharedStackView {
    base: StackPointer,
    limit: StackPointer,
}

/// The stack a fiber's execution context runs on.
pub(crate) enum FiberStack {
    #[cfg(not(windows))]
    Shared(SharedStackView),
    Private(DefaultStack),
}

impl FiberStack {
    pub(crate) fn is_shared(&self) -> bool {
        !matches!(self, FiberStack::Private(_))
    }
}

// SAFETY: a shared view points into a `SharedStack` that the owning scheduler
// keeps alive until every context built on it is gone.
unsafe impl Stack for FiberStack {
    fn base(&self) -> StackPointer {
        match self {
            #[cfg(not(windows))]
            FiberStack::Shared(view) => view.base,
            FiberStack::Private(stack) => stack.base(),
        }
    }

    fn limit(&self) -> StackPointer {
        match self {
            #[cfg(not(windows))]
            FiberStack::Shared(view) => view.limit,
            FiberStack::Private(stack) => stack.limit(),
        }
    }

    #[cfg(windows)]
    fn teb_fields(&self) -> StackTebFields {
        match self {
            FiberStack::Private(stack) => stack.teb_fields(),
        }
    }

    #[cfg(windows)]
    fn update_teb_fields(&mut self, stack_limit: usize, guaranteed_stack_bytes: usize) {
        match self {
            FiberStack::Private(stack) => stack.update_teb_fields(stack_limit, guaranteed_stack_bytes),
        }
    }
}
