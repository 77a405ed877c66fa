//! Thread identity and job affinity.
//!
//! Every OS thread that touches the job scheduler gets a small, process-unique
//! [`ThreadToken`]. An [`Affinity`] is matched against the token of the thread
//! that is looking for work.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static TOKEN: ThreadToken = ThreadToken::allocate();
}

/// Process-unique identity of an OS thread.
///
/// Tokens are positive `i32` values so that their bitwise complement is always
/// negative, which keeps the packed [`Affinity::to_raw`] form unambiguous.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ThreadToken(NonZeroU32);

impl ThreadToken {
    fn allocate() -> Self {
        let raw = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        assert!(raw <= i32::MAX as u32, "thread token space exhausted");
        // `raw` starts at 1 and only grows.
        ThreadToken(NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Returns the token of the calling thread.
pub fn current_thread_token() -> ThreadToken {
    TOKEN.with(|token| *token)
}

/// Which threads may execute a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum Affinity {
    /// Any participating thread.
    #[default]
    Any,
    /// Only the given thread.
    Only(ThreadToken),
    /// Every thread except the given one.
    Except(ThreadToken),
}

impl Affinity {
    /// Pins to the calling thread.
    pub fn this_thread() -> Self {
        Affinity::Only(current_thread_token())
    }

    /// Excludes the calling thread.
    pub fn not_this_thread() -> Self {
        Affinity::Except(current_thread_token())
    }

    pub fn matches(self, token: ThreadToken) -> bool {
        match self {
            Affinity::Any => true,
            Affinity::Only(only) => only == token,
            Affinity::Except(except) => except != token,
        }
    }

    /// Packed integer form: `0` for any thread, a token for exactly that
    /// thread, the bitwise complement of a token for every other thread.
    pub fn to_raw(self) -> i32 {
        match self {
            Affinity::Any => 0,
            Affinity::Only(token) => token.get() as i32,
            Affinity::Except(token) => !(token.get() as i32),
        }
    }

    pub fn from_raw(raw: i32) -> Self {
        let token = |value: i32| ThreadToken(NonZeroU32::new(value as u32).unwrap_or(NonZeroU32::MIN));
        match raw {
            0 => Affinity::Any,
            r if r > 0 => Affinity::Only(token(r)),
            r => Affinity::Except(token(!r)),
        }
    }
}
