//! Diagnostic logging setup.
//!
//! Status lines are not logs: they go through [`crate::status`]. This only
//! configures `tracing` output on stderr.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Maps a `FORKPIPE_LOG` value to a filter directive for this crate.
fn directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("error") => "error",
        Some("off") => "off",
        _ => "warn",
    };
    format!("forkpipe={level}")
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `FORKPIPE_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. Safe to call more than once.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(directive(std::env::var("FORKPIPE_LOG").ok().as_deref()))
    };

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
}
