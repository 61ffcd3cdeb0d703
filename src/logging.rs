//! Tracing subscriber setup shared by the binaries.
//!
//! `RUST_LOG` takes precedence; otherwise the level passed on the command
//! line (default `info`) applies. Logs go to stderr so that stdout stays free
//! for report output.

use tracing_subscriber::EnvFilter;

pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // A second initialization (e.g. from tests) is not an error worth failing on.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
