//! Process-wide tracing setup.
//!
//! Replaces a thread-unsafe global logger pattern (one mutable logger
//! struct reached from every translation unit) with a `tracing_subscriber`
//! registry installed once per process.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global `tracing` subscriber, reading verbosity from
/// `RUST_LOG` (defaulting to `info`). Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Build a per-engine-instance span carrying the execution id and rank, to
/// be `enter()`-ed by call sites that want every log line attributed to a
/// specific run. This is the "context-aware logger passed by reference"
/// called for in the design notes, realized as a tracing span rather than a
/// bespoke struct.
pub fn engine_span(execution_id: &str, rank: i32) -> tracing::Span {
    tracing::info_span!("engine", execution_id = %execution_id, rank)
}
