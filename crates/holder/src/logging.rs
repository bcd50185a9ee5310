//! Tracing setup for the holder binaries.
//!
//! `RUST_LOG` wins when set. Otherwise `HOLDER_LOG` picks the level for the
//! holder crates (`debug`, `info`, `warn`, `error`; default `info`).
//! `LOG_FORMAT=json` switches to JSON lines. Output always goes to stderr,
//! which keeps stdout free for results and keeps worker stdout separate.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn base_level(holder_log: Option<&str>) -> &'static str {
    match holder_log {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(holder_log: Option<&str>) -> String {
    format!(
        "holder={level},holder_echo_worker={level}",
        level = base_level(holder_log)
    )
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let holder_log = std::env::var("HOLDER_LOG").ok();
        EnvFilter::new(filter_directives(holder_log.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

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
