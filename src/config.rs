//! Configuration for the worker pool and fiber schedulers.
//!
//! Both structs deserialize from JSON with every field optional:
//!
//! ```
//! use jobfiber::config::{SchedulerConfig, PinningStrategy};
//!
//! let config = SchedulerConfig::from_json(r#"{ "num_workers": 2, "pinning": "Linear" }"#).unwrap();
//! assert_eq!(config.num_workers, 2);
//! assert_eq!(config.pinning, PinningStrategy::Linear);
//! ```

use crate::error::SystemError;
use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

impl PinningStrategy {
    /// Logical core index for worker `worker`, given `cores` logical cores.
    pub fn core_for(self, worker: usize, cores: usize) -> Option<usize> {
        if cores == 0 {
            return None;
        }
        match self {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(worker % cores),
            PinningStrategy::AvoidSMT => {
                let physical = cores.div_ceil(2);
                Some((worker % physical) * 2)
            }
        }
    }
}

/// Configuration for [`JobSystem`](crate::JobSystem) and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads; `0` means one per logical CPU.
    pub num_workers: usize,
    pub pinning: PinningStrategy,
    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
    /// Upper bound of the idle backoff sleep, in microseconds.
    pub idle_backoff_max_us: u64,
    /// Time a worker spends inside one `do_some_job` call, in microseconds.
    pub time_slice_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            num_workers: 0,
            pinning: PinningStrategy::None,
            thread_name_prefix: "job-worker".to_string(),
            idle_backoff_max_us: 1000,
            time_slice_us: 2000,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(num_workers: usize) -> Self {
        SchedulerConfig {
            num_workers,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, SystemError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Worker count with `0` resolved to the number of logical CPUs.
    pub fn resolved_workers(&self) -> usize {
        match self.num_workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }
}

/// Configuration for a [`FiberScheduler`](crate::FiberScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    /// Size of the stack region shared by every fiber without a private stack.
    pub shared_stack_size: usize,
    /// Default size for fibers created with a private stack.
    pub private_stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            shared_stack_size: 512 * 1024,
            private_stack_size: 128 * 1024,
        }
    }
}

impl FiberConfig {
    pub fn from_json(json: &str) -> Result<Self, SystemError> {
        Ok(serde_json::from_str(json)?)
    }
}
