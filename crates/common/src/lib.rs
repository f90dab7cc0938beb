//! Process-wide plumbing shared by all tether crates.
//!
//! Currently this is logging: `tracing` subscriber initialization plus a
//! bounded in-memory ring buffer that diagnostics surfaces can read back
//! without tailing a file.

pub mod logbuf;

pub use logbuf::{LogBuffer, LogEntry, shared_log_buffer};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber: env-filter (`TETHER_LOG`, falling
/// back to `info`), stderr fmt output, and the shared log ring buffer.
///
/// Call once at startup; subsequent calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let buffer = logbuf::BufferLayer::new(shared_log_buffer().clone());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(buffer)
        .try_init();
}
