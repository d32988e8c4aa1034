//! Tracing setup shared by host binaries and workers.
//!
//! Logs always go to stderr: a worker's stdout belongs to the protocol.
//!
//! - `RUST_LOG` wins when set.
//! - Otherwise `SIDECAR_LOG` (`debug`, `info`, `warn`, `error`) sets the level
//!   for this crate and the bundled binaries.
//! - `LOG_FORMAT=json` switches to JSON lines.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_LEVEL_VAR: &str = "SIDECAR_LOG";
pub const LOG_FORMAT_VAR: &str = "LOG_FORMAT";

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(std::env::var(LOG_LEVEL_VAR).ok().as_deref()))
    };

    let use_json = std::env::var(LOG_FORMAT_VAR).as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level.map(str::trim) {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("sidecar_rpc={level},sidecar_echo={level}")
}
