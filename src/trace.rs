//! Log output setup.
//!
//! The library only emits `tracing` events; it never installs a subscriber on
//! its own. Binaries and tests call [`init`] to print them, filtered through
//! `RUST_LOG` (for example `RUST_LOG=jobfiber=trace`).

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "jobfiber=info";

/// Installs a formatting subscriber on stderr. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Like [`init`], but routes output through the test harness's capture.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobfiber=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
