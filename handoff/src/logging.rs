//! Tracing subscriber setup shared by master and workers.
//!
//! - `RUST_LOG` wins when set.
//! - Otherwise `HANDOFF_LOG` (`debug`, `info`, `warn`, `error`) sets the level for
//!   handoff itself and `app` for the binary's own targets. Default `info`.
//! - `LOG_FORMAT=json` switches to JSON lines.
//!
//! Output goes to stderr, which master and workers share.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV: &str = "HANDOFF_LOG";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(level: &str, app: &str) -> String {
    format!("handoff={level},{app}={level}")
}

/// Install the global subscriber. `app` is the binary's crate name (its log target).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(app: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
        EnvFilter::new(filter_directives(level, app))
    };

    let use_json = std::env::var(LOG_FORMAT_ENV).as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
