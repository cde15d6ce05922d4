use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a process-wide tracing subscriber. Safe to call more than once;
/// later calls are no-ops (mirrors the teacher's `.try_init().ok()` pattern
/// so library tests that double-initialize tracing don't panic).
pub fn init() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}
