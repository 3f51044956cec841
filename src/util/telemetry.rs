//! Tracing subscriber setup for binaries and tests embedding the scheduler.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_DIRECTIVES: &str = "prometheus_scheduling=info";

/// Install an fmt subscriber filtered by `RUST_LOG`, or by
/// [`DEFAULT_LOG_DIRECTIVES`] when the variable is unset.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_LOG_DIRECTIVES);
}

/// Like [`init_tracing`], with `fallback` as the filter when `RUST_LOG` is unset
/// or unparsable.
pub fn init_tracing_with(fallback: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
