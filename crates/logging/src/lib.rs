//! InferMesh Logging
//!
//! `tracing-subscriber` setup shared by the CLI and the test suites.
//! `RUST_LOG` always overrides the default filter.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,infermesh=debug";

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Panics if one is already set.
pub fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter(default_filter))
        .init();
}

/// Subscriber for tests: output captured per test, repeated calls ignored
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn,infermesh=debug"))
        .with_test_writer()
        .try_init();
}
