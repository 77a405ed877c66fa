//! Generation-stamped handle arena.
//!
//! `HandleTable` hands out 32-bit handles whose low bits index a slot and whose
//! high bits carry a generation counter. Freeing a slot bumps its generation,
//! so a handle to a previous occupant no longer resolves: stale handles read as
//! *absent*, never as an error. Values live in a [`Slab`]; the table keeps
//! the generation of each slot next to it. Both job proxies and fibers live
//! in one of these.
//!
//! The generation is 16 bits wide and wraps silently. After 65 535 reuses of
//! a single slot a very old handle can alias a new occupant. This is a known
//! limitation and is deliberately left as is.

use slab::Slab;
use std::fmt;

/// Number of low bits holding the slot index.
pub const INDEX_BITS: u32 = 16;
/// Number of high bits holding the generation counter.
pub const GENERATION_BITS: u32 = 32 - INDEX_BITS;
/// Maximum number of simultaneously live handles.
pub const MAX_SLOTS: usize = 1 << INDEX_BITS;

const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// An opaque `index | generation << INDEX_BITS` value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    fn new(index: u32, generation: u32) -> Self {
        debug_assert!(index <= INDEX_MASK);
        Handle(((generation & GENERATION_MASK) << INDEX_BITS) | index)
    }

    /// Slot index part of the handle.
    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// Generation part of the handle.
    pub fn generation(self) -> u32 {
        self.0 >> INDEX_BITS
    }

    /// Returns the packed 32-bit representation.
    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Rebuilds a handle from its packed representation.
    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Slab of values plus a generation per slot.
///
/// Freed slots are reused most-recent-first. Not synchronized; owners wrap it
/// in their own lock.
pub struct HandleTable<T> {
    slab: Slab<T>,
    generations: Vec<u16>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        HandleTable {
            slab: Slab::new(),
            generations: Vec::new(),
        }
    }

    /// Inserts a value and returns its handle.
    ///
    /// # Panics
    ///
    /// Panics when all `MAX_SLOTS` slots are live. Exhaustion is treated as
    /// fatal, like any other allocation failure.
    pub fn insert(&mut self, value: T) -> Handle {
        self.insert_with(|_| value)
    }

    /// Inserts a value built from its own handle.
    pub fn insert_with(&mut self, build: impl FnOnce(Handle) -> T) -> Handle {
        let entry = self.slab.vacant_entry();
        let index = entry.key();
        assert!(index < MAX_SLOTS, "handle table exhausted ({MAX_SLOTS} live slots)");
        if index == self.generations.len() {
            self.generations.push(1);
        }

        let handle = Handle::new(index as u32, u32::from(self.generations[index]));
        entry.insert(build(handle));
        handle
    }

    /// Removes the value behind `handle`, returning it.
    ///
    /// Returns `None` for stale handles; the slot is left untouched.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let index = handle.index();
        let value = self.slab.try_remove(index)?;
        self.generations[index] = next_generation(self.generations[index]);
        Some(value)
    }

    fn is_current(&self, handle: Handle) -> bool {
        self.generations
            .get(handle.index())
            .is_some_and(|&generation| u32::from(generation) == handle.generation())
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        if !self.is_current(handle) {
            return None;
        }
        self.slab.get(handle.index())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        if !self.is_current(handle) {
            return None;
        }
        self.slab.get_mut(handle.index())
    }

    /// True iff `handle` names a live value.
    pub fn contains(&self, handle: Handle) -> bool {
        self.is_current(handle) && self.slab.contains(handle.index())
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Iterates over live values with their handles, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slab.iter().map(|(index, value)| {
            let handle = Handle::new(index as u32, u32::from(self.generations[index]));
            (handle, value)
        })
    }

    /// Removes every live value, in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        for (index, _) in self.slab.iter() {
            self.generations[index] = next_generation(self.generations[index]);
        }
        self.slab.drain().collect()
    }
}

// Generation 0 is never issued, so an all-zero handle is always stale.
fn next_generation(generation: u16) -> u16 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}
