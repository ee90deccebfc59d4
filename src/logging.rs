//! Tracing subscriber setup for the `tg` binary.
//!
//! Library code only emits events; installing a subscriber is the binary's job.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Filter precedence: `RUST_LOG`, then `-v` count, then the config file level.
pub fn filter_directive(config: &LogConfig, verbosity: u8) -> String {
    match verbosity {
        0 => config.level.clone(),
        1 => "taskgraph=debug,tg=debug".to_string(),
        _ => "taskgraph=trace,tg=trace".to_string(),
    }
}

pub fn init(config: &LogConfig, verbosity: u8) {
    // Ignore unparsable or absurd RUST_LOG values instead of failing startup.
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| {
            let raw = raw.trim();
            if raw.is_empty() || raw.len() > 4096 {
                return None;
            }
            EnvFilter::try_new(raw).ok()
        })
        .unwrap_or_else(|| {
            EnvFilter::try_new(filter_directive(config, verbosity))
                .unwrap_or_else(|_| EnvFilter::new("warn"))
        });

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = result;
}
